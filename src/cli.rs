//! CLI argument parsing using clap 4.x derive macros

use clap::{Parser, Subcommand};

/// Terminal front-end for a conversational virtual being
///
/// Downloads a being profile, opens the configured transports and lets you
/// talk to the being from stdin while inbound actions stream to the screen.
#[derive(Parser, Debug)]
#[command(name = "sona")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a conversation and chat from stdin
    Chat {
        /// URL of the being profile configuration document
        #[arg(short, long)]
        url: String,

        /// Profile id credential
        #[arg(long)]
        profile_id: String,

        /// Profile secret credential
        #[arg(long)]
        profile_secret: String,

        /// Application identifier sent with every request
        #[arg(long, default_value = "sona-cli")]
        app_identifier: String,

        /// Discard any stored conversation and start fresh
        #[arg(short, long)]
        new: bool,
    },

    /// Download and pretty-print the being configuration
    Config {
        /// URL of the being profile configuration document
        #[arg(short, long)]
        url: String,

        /// Profile id credential
        #[arg(long)]
        profile_id: String,

        /// Profile secret credential
        #[arg(long)]
        profile_secret: String,

        /// Application identifier sent with every request
        #[arg(long, default_value = "sona-cli")]
        app_identifier: String,
    },
}
