//! sona-core: communication core for a conversational virtual being.
//!
//! The crate is organized around a capability-routing dispatcher over
//! pluggable transport handlers:
//!
//! - `config` — downloaded, validated being profile (engines, bindings)
//! - `auth` — header signing for every request and handshake
//! - `session` — conversation identity and its persistence collaborator
//! - `action` — wire model and the typed inbound-action vocabulary
//! - `token` — handler→dispatcher event queue and per-variant streams
//! - `handler` / `handlers` — transport contract and the bundled
//!   conversation-socket, STT-socket and TTS-HTTP implementations
//! - `dispatcher` — capability routing, session lifecycle, disposal
//! - `being` — behavioral state machine and the application-facing facade

pub mod action;
pub mod auth;
pub mod being;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod handlers;
pub mod session;
pub mod token;
pub mod util;

pub use action::{BeingAction, ConnectionEvent, InboundAction, UserAction, VoiceData};
pub use auth::{HeaderSigner, NoopSigner, ProfileSigner};
pub use being::{Being, BeingBehaviour, BeingSettings, BeingState, BeingStateMachine, StateTimeouts};
pub use config::{BeingConfig, ConfigDownloader, Protocol};
pub use dispatcher::CommunicationDispatcher;
pub use error::{Result, SonaError};
pub use handler::{Capability, CommunicationHandler};
pub use session::{JsonFileSessionStore, MemorySessionStore, SessionStore, StoredSession};
pub use token::DispatcherEvents;
