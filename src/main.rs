//! `sona` - terminal front-end for a conversational virtual being
//!
//! This binary downloads a being profile, assembles the communication
//! dispatcher and lets you chat with the being from stdin while inbound
//! actions and state changes stream to the screen.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use console::Style;

use crate::cli::{Cli, Commands};
use sona_core::being::{Being, BeingSettings, StateTimeouts};
use sona_core::session::JsonFileSessionStore;
use sona_core::{BeingConfig, ConfigDownloader, ProfileSigner};

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Chat {
            url,
            profile_id,
            profile_secret,
            app_identifier,
            new,
        } => {
            let settings = BeingSettings {
                config_url: url,
                app_identifier,
                profile_id,
                profile_secret,
                auto_start_conversation: true,
                timeouts: StateTimeouts::default(),
            };
            run_chat(settings, new).await?;
        }

        Commands::Config {
            url,
            profile_id,
            profile_secret,
            app_identifier,
        } => {
            print_config(&url, &app_identifier, &profile_id, &profile_secret).await?;
        }
    }
    Ok(())
}

async fn run_chat(settings: BeingSettings, force_new: bool) -> Result<()> {
    let store = Arc::new(JsonFileSessionStore::new().context("Failed to locate session store")?);
    let being = Being::connect(&settings, store)
        .await
        .context("Failed to connect to the being")?;

    let printer = spawn_event_printer(&being);

    being
        .user_has_approached(force_new)
        .await
        .context("Failed to start the conversation")?;

    let dim = Style::new().dim();
    println!("{}", dim.apply_to("Connected. Type a message, Ctrl-C to quit."));

    let mut lines = stdin_lines();
    loop {
        tokio::select! {
            line = lines.recv() => match line {
                Some(line) => {
                    let line = line.trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    if let Err(e) = being.send_text(line).await {
                        eprintln!("{}", Style::new().red().apply_to(e.user_message()));
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!("{}", dim.apply_to("Shutting down..."));
    being.dispose().await;
    printer.abort();
    Ok(())
}

/// Stream stdin lines into a channel so the async loop never blocks on a
/// read.
fn stdin_lines() -> tokio::sync::mpsc::UnboundedReceiver<String> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    rx
}

fn spawn_event_printer(being: &Being) -> tokio::task::JoinHandle<()> {
    let mut being_actions = being.events().being_actions();
    let mut signals = being.events().signals();
    let mut connection = being.events().connection_events();
    let mut states = being.state_changes();

    tokio::spawn(async move {
        let cyan = Style::new().cyan().bold();
        let yellow = Style::new().yellow();
        let dim = Style::new().dim();
        loop {
            tokio::select! {
                action = being_actions.recv() => match action {
                    Ok(action) => {
                        if let Some(text) = action.text {
                            println!("{} {text}", cyan.apply_to("being>"));
                        }
                        if let Some(voice) = action.voice {
                            log::debug!("received {} bytes of synthesized voice", voice.data.len());
                        }
                    }
                    Err(_) => break,
                },
                signal = signals.recv() => match signal {
                    Ok(signal) => println!("{} {}", yellow.apply_to("signal:"), signal.name),
                    Err(_) => break,
                },
                event = connection.recv() => match event {
                    Ok(event) => println!("{}", dim.apply_to(format!("[connection: {event:?}]"))),
                    Err(_) => break,
                },
                state = states.recv() => match state {
                    Ok(state) => println!("{}", dim.apply_to(format!("[state: {state}]"))),
                    Err(_) => break,
                },
            }
        }
    })
}

async fn print_config(
    url: &str,
    app_identifier: &str,
    profile_id: &str,
    profile_secret: &str,
) -> Result<()> {
    let signer = Arc::new(ProfileSigner::new(app_identifier, profile_id, profile_secret));
    let downloader = ConfigDownloader::new(url, signer)?;
    let raw = downloader
        .download_raw()
        .await
        .context("Failed to download configuration")?;

    // Validate before printing so a broken document fails loudly.
    let config = BeingConfig::from_json(&raw).context("Configuration is invalid")?;

    let document: serde_json::Value = serde_json::from_str(&raw)?;
    println!("{}", serde_json::to_string_pretty(&document)?);

    let dim = Style::new().dim();
    println!(
        "{}",
        dim.apply_to(format!(
            "validated: {} conversation binding(s), stt fallback: {}, tts fallback: {}",
            config.conversation.len(),
            config.fallback_stt.is_some(),
            config.fallback_tts.is_some(),
        ))
    );
    Ok(())
}
