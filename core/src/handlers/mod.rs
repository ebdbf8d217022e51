//! Transport handler implementations and their assembly.
//!
//! Assembly is two-pass: conversation bindings come first, in document
//! order, then fallback audio engines fill whatever capability gaps the
//! conversation handlers left. A fallback whose binding names a protocol its
//! handler cannot serve is a fatal configuration error, surfaced before any
//! connection is attempted.

mod socket;
mod stt;
mod tts;

pub use socket::ConversationSocketHandler;
pub use stt::SttSocketHandler;
pub use tts::TtsHttpHandler;

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::auth::HeaderSigner;
use crate::config::{BeingConfig, Protocol};
use crate::error::{Result, SonaError};
use crate::handler::{Capability, CommunicationHandler, EngineOverrides, RoutedRequest, SpeechCue};
use crate::token::ActionToken;
use crate::util;

/// Shared wiring every handler is constructed with.
pub struct HandlerContext {
    /// `scheme://authority` of the backend, joined with each binding's path.
    pub host: String,
    pub signer: Arc<dyn HeaderSigner>,
    pub token: ActionToken,
    pub requests: mpsc::UnboundedSender<RoutedRequest>,
    pub overrides: Arc<EngineOverrides>,
    pub speech_cues: broadcast::Sender<SpeechCue>,
}

/// Build the handler set for one validated config.
pub fn assemble_handlers(
    config: &BeingConfig,
    ctx: &HandlerContext,
) -> Result<Vec<Arc<dyn CommunicationHandler>>> {
    let mut handlers: Vec<Arc<dyn CommunicationHandler>> = Vec::new();

    for binding in &config.conversation {
        if binding.protocol.is_socket() {
            let url = util::to_ws_url(&ctx.host, &binding.path);
            handlers.push(Arc::new(ConversationSocketHandler::new(
                url,
                ctx.signer.clone(),
                ctx.token.clone(),
                ctx.requests.clone(),
            )));
        } else {
            // Only socket transports carry a full conversation; a non-socket
            // binding is tolerated in the document but never instantiated.
            tracing::warn!(
                protocol = %binding.protocol,
                path = %binding.path,
                "skipping non-socket conversation binding"
            );
        }
    }

    fn covers(handlers: &[Arc<dyn CommunicationHandler>], capability: Capability) -> bool {
        handlers.iter().any(|h| h.has_capability(capability))
    }

    if let Some(stt) = &config.fallback_stt {
        if !covers(&handlers, Capability::SendAudio)
            && !covers(&handlers, Capability::SendAudioStream)
        {
            if !stt.binding.protocol.is_socket() {
                return Err(SonaError::UnsupportedProtocol {
                    engine: "stt".to_string(),
                    protocol: stt.binding.protocol.to_string(),
                });
            }
            let url = util::to_ws_url(&ctx.host, &stt.binding.path);
            let handler = Arc::new(SttSocketHandler::new(
                url,
                ctx.signer.clone(),
                ctx.token.clone(),
                ctx.requests.clone(),
                ctx.overrides.clone(),
                stt.audio,
            ));
            handler.attach_speech_cues(ctx.speech_cues.subscribe());
            handlers.push(handler);
        }
    }

    if let Some(tts) = &config.fallback_tts {
        if !covers(&handlers, Capability::ProcessTts) {
            if tts.binding.protocol != Protocol::Http {
                return Err(SonaError::UnsupportedProtocol {
                    engine: "tts".to_string(),
                    protocol: tts.binding.protocol.to_string(),
                });
            }
            let url = util::join_url(&ctx.host, &tts.binding.path);
            handlers.push(Arc::new(TtsHttpHandler::new(
                url,
                ctx.signer.clone(),
                config.location_id.clone(),
                tts.audio,
            )));
        }
    }

    if handlers.is_empty() {
        return Err(SonaError::configuration(
            "config yields no usable communication handlers",
        ));
    }

    tracing::debug!(count = handlers.len(), "handlers assembled");
    Ok(handlers)
}
