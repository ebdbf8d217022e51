//! The communication-handler contract every transport implements.
//!
//! A handler owns exactly one transport connection and advertises a fixed
//! capability set chosen at construction. The dispatcher only calls
//! `make_action` for capabilities the handler declared and only after
//! `prepare` succeeded for the current session.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::action::VoiceData;
use crate::error::Result;
use crate::session::Session;

/// Outgoing request kinds a handler can serve. Declared once per handler,
/// never changed for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    SendText,
    SendSignal,
    SendAudio,
    SendAudioStream,
    ProcessTts,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SendText => "send-text",
            Self::SendSignal => "send-signal",
            Self::SendAudio => "send-audio",
            Self::SendAudioStream => "send-audio-stream",
            Self::ProcessTts => "process-tts",
        };
        write!(f, "{name}")
    }
}

/// A speech-synthesis job. The synthesized voice is delivered over `reply`;
/// dropping the sender without replying signals failure to the requester.
#[derive(Debug)]
pub struct TtsRequest {
    pub text: String,
    pub language: Option<String>,
    pub voice: Option<String>,
    pub reply: Option<oneshot::Sender<VoiceData>>,
}

/// Typed payload for one outgoing request, mirroring the capability set.
#[derive(Debug)]
pub enum ActionRequest {
    Text(String),
    Signal { name: String, value: String },
    Audio(Vec<u8>),
    AudioStream(Vec<u8>),
    Tts(TtsRequest),
}

impl ActionRequest {
    pub fn capability(&self) -> Capability {
        match self {
            Self::Text(_) => Capability::SendText,
            Self::Signal { .. } => Capability::SendSignal,
            Self::Audio(_) => Capability::SendAudio,
            Self::AudioStream(_) => Capability::SendAudioStream,
            Self::Tts(_) => Capability::ProcessTts,
        }
    }
}

/// A request a handler asks the dispatcher to route on its behalf: the
/// conversation socket requests synthesis for being text it received, the
/// STT socket forwards final transcripts as outgoing text.
#[derive(Debug)]
pub enum RoutedRequest {
    ProcessTts {
        text: String,
        language: Option<String>,
    },
    SendText(String),
}

/// User speech boundary cues. The being facade broadcasts these so
/// on-demand audio transports know when to hold a socket open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechCue {
    Started,
    Stopped,
}

/// Contract implemented per transport. All methods take `&self`; concrete
/// handlers own whatever interior mutability their transport needs.
#[async_trait]
pub trait CommunicationHandler: Send + Sync {
    /// Short stable name used in logs and connection errors.
    fn name(&self) -> &str;

    /// Pure lookup against the static declared capability set.
    fn has_capability(&self, capability: Capability) -> bool;

    /// Whether `prepare` has succeeded for the current session.
    fn is_prepared(&self) -> bool;

    /// Perform whatever handshake/auth this session needs. Idempotent for
    /// the same session; fails with a connection error if the transport
    /// cannot be established.
    async fn prepare(&self, session: Arc<Session>) -> Result<()>;

    /// Perform the transport-specific request. Only called after
    /// `has_capability` returned true and `prepare` succeeded.
    async fn make_action(&self, request: ActionRequest) -> Result<()>;

    /// Best-effort cancellation of queued outbound work. Never fails and
    /// does not abort requests already on the wire.
    fn clear_processing_queue(&self);

    /// Release transport resources. Safe to call multiple times; the
    /// owner-registered teardown hook runs exactly once.
    async fn dispose(&self);
}

impl std::fmt::Debug for dyn CommunicationHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommunicationHandler")
            .field("name", &self.name())
            .finish()
    }
}

/// Owner-registered teardown callback that runs exactly once, no matter how
/// many times `dispose` is called.
#[derive(Default)]
pub struct DisposeHook {
    hook: parking_lot::Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl DisposeHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, hook: impl FnOnce() + Send + 'static) {
        *self.hook.lock() = Some(Box::new(hook));
    }

    pub fn run(&self) {
        if let Some(hook) = self.hook.lock().take() {
            hook();
        }
    }
}

/// Runtime-adjustable engine preferences shared between the facade, the
/// dispatcher and the audio handlers. Overrides default language/voice
/// choices negotiated in the profile.
#[derive(Default)]
pub struct EngineOverrides {
    pub stt_language: parking_lot::RwLock<Option<String>>,
    pub tts_language: parking_lot::RwLock<Option<String>>,
    pub tts_voice: parking_lot::RwLock<Option<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_action_request_capability() {
        assert_eq!(
            ActionRequest::Text("hi".to_string()).capability(),
            Capability::SendText
        );
        assert_eq!(
            ActionRequest::AudioStream(vec![0u8; 4]).capability(),
            Capability::SendAudioStream
        );
    }

    #[test]
    fn test_dispose_hook_runs_exactly_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let hook = DisposeHook::new();
        let c = count.clone();
        hook.set(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        hook.run();
        hook.run();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
