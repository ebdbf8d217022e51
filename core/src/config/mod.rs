//! Being configuration
//!
//! The downloaded profile document declares, per engine kind, which
//! transport bindings are available. Everything here is validated once at
//! load time; the dispatcher only ever sees an immutable [`BeingConfig`].

mod downloader;
mod schema;

pub use downloader::ConfigDownloader;
pub use schema::ConfigDocument;

use std::fmt;
use std::str::FromStr;

use crate::action::AudioParameters;
use crate::error::{Result, SonaError};

/// Transport protocols an engine binding can name. The set is closed:
/// unknown protocol strings fail validation at load time instead of deep
/// inside request handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Local,
    Http,
    Ws,
    SocketIo,
    WsEndless,
}

impl Protocol {
    /// Whether this protocol is served by a persistent socket handler.
    pub fn is_socket(self) -> bool {
        matches!(self, Self::Ws | Self::SocketIo | Self::WsEndless)
    }
}

impl FromStr for Protocol {
    type Err = SonaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Self::Local),
            "http" => Ok(Self::Http),
            "ws" => Ok(Self::Ws),
            "socket-io" => Ok(Self::SocketIo),
            "ws-endless" => Ok(Self::WsEndless),
            other => Err(SonaError::configuration(format!(
                "unknown connection protocol '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Local => "local",
            Self::Http => "http",
            Self::Ws => "ws",
            Self::SocketIo => "socket-io",
            Self::WsEndless => "ws-endless",
        };
        write!(f, "{name}")
    }
}

/// Engine kinds a binding can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Conversation,
    SpeechToText,
    TextToSpeech,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Conversation => "conversation",
            Self::SpeechToText => "stt",
            Self::TextToSpeech => "tts",
        };
        write!(f, "{name}")
    }
}

/// One (protocol, address-path) transport binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub protocol: Protocol,
    pub path: String,
}

/// A fallback audio-engine binding with its negotiated audio framing.
#[derive(Debug, Clone)]
pub struct AudioBinding {
    pub binding: Binding,
    pub audio: AudioParameters,
}

/// Validated description of the engines available to one being profile.
/// Immutable after validation; the dispatcher reads it, nothing writes it.
#[derive(Debug, Clone)]
pub struct BeingConfig {
    pub location_id: Option<String>,
    pub profile_name: Option<String>,
    /// Conversation engine bindings, in document order.
    pub conversation: Vec<Binding>,
    /// Fallback STT binding, used only when no conversation handler can
    /// accept audio.
    pub fallback_stt: Option<AudioBinding>,
    /// Fallback TTS binding, used only when no conversation handler can
    /// synthesize speech.
    pub fallback_tts: Option<AudioBinding>,
}

impl BeingConfig {
    /// Parse and validate a downloaded configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        let doc: ConfigDocument = serde_json::from_str(json)
            .map_err(|e| SonaError::configuration(format!("invalid config document: {e}")))?;
        Self::from_document(doc)
    }

    pub fn from_document(doc: ConfigDocument) -> Result<Self> {
        let engines = doc
            .engines
            .ok_or_else(|| SonaError::configuration("config document declares no engines"))?;

        let mut conversation = Vec::new();
        if let Some(engine) = engines.conversation {
            for entry in engine.connection_handlers {
                conversation.push(Binding {
                    protocol: entry.protocol.parse()?,
                    path: entry.path,
                });
            }
        }

        // Audio engines carry at most one fallback binding each; the first
        // listed wins.
        let fallback_stt = Self::first_audio_binding(engines.stt)?;
        let fallback_tts = Self::first_audio_binding(engines.tts)?;

        let (location_id, profile_name) = match doc.profile {
            Some(profile) => (profile.id, profile.name),
            None => (None, None),
        };

        Ok(Self {
            location_id,
            profile_name,
            conversation,
            fallback_stt,
            fallback_tts,
        })
    }

    fn first_audio_binding(
        section: Option<schema::AudioEngineSection>,
    ) -> Result<Option<AudioBinding>> {
        let Some(section) = section else {
            return Ok(None);
        };
        let Some(entry) = section.connection_handlers.into_iter().next() else {
            return Ok(None);
        };
        Ok(Some(AudioBinding {
            binding: Binding {
                protocol: entry.protocol.parse()?,
                path: entry.path,
            },
            audio: section
                .audio_parameters
                .into_iter()
                .next()
                .unwrap_or_default(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_DOC: &str = r#"{
        "schema": "v3",
        "profile": { "id": "loc-1", "name": "Concierge" },
        "engines": {
            "convAi": {
                "connectionHandlers": [
                    { "path": "/api/conversation", "protocol": "socket-io" }
                ]
            },
            "stt": {
                "connectionHandlers": [
                    { "path": "/api/stt", "protocol": "ws" }
                ],
                "audioParameters": [
                    { "channels": 1, "frequency": 22050, "sampleBits": 16 }
                ]
            },
            "tts": {
                "connectionHandlers": [
                    { "path": "/api/tts", "protocol": "http" }
                ]
            }
        }
    }"#;

    #[test]
    fn test_full_document_parses() {
        let config = BeingConfig::from_json(FULL_DOC).unwrap();
        assert_eq!(config.location_id.as_deref(), Some("loc-1"));
        assert_eq!(config.conversation.len(), 1);
        assert_eq!(config.conversation[0].protocol, Protocol::SocketIo);

        let stt = config.fallback_stt.unwrap();
        assert_eq!(stt.binding.protocol, Protocol::Ws);
        assert_eq!(stt.audio.frequency, 22_050);

        let tts = config.fallback_tts.unwrap();
        assert_eq!(tts.binding.protocol, Protocol::Http);
        // No audioParameters listed: defaults apply
        assert_eq!(tts.audio.frequency, 16_000);
    }

    #[test]
    fn test_unknown_protocol_fails_at_load() {
        let doc = r#"{
            "engines": {
                "convAi": {
                    "connectionHandlers": [
                        { "path": "/api/conversation", "protocol": "carrier-pigeon" }
                    ]
                }
            }
        }"#;
        let err = BeingConfig::from_json(doc).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("carrier-pigeon"));
    }

    #[test]
    fn test_missing_engines_fails() {
        assert!(BeingConfig::from_json(r#"{ "profile": { "id": "x" } }"#).is_err());
    }

    #[test]
    fn test_first_fallback_binding_wins() {
        let doc = r#"{
            "engines": {
                "stt": {
                    "connectionHandlers": [
                        { "path": "/stt-a", "protocol": "ws" },
                        { "path": "/stt-b", "protocol": "http" }
                    ]
                }
            }
        }"#;
        let config = BeingConfig::from_json(doc).unwrap();
        assert_eq!(config.fallback_stt.unwrap().binding.path, "/stt-a");
    }
}
