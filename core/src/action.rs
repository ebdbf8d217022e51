//! Conversation wire messages and the typed inbound action vocabulary.
//!
//! The wire structs mirror the camelCase JSON spoken by the conversation
//! engines; `InboundAction` is the normalized, typed union the dispatcher
//! re-emits to subscribers. Exactly one variant is populated per instance
//! and instances are never mutated after creation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Conversational text payload, possibly carrying markup renditions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextAction {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssml: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_recognized_state: Option<String>,
}

impl TextAction {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

/// Name/value signal, e.g. "conversation-start"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// Engine lifecycle event reported by the conversation backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineEvent {
    pub state: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta_data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedAction {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_json: Option<Value>,
}

/// Opaque action the application interprets on its own
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomAction {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndUserStore {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

// ---------------------------------------------------------------------------
// UI prompts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiAction {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Ui>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ui {
    #[serde(default)]
    pub buttons: Vec<UiButton>,
    #[serde(default)]
    pub cards: Vec<UiCard>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<UiInput>,
    #[serde(rename = "timeoutMs", default)]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiButton {
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiCard {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<UiPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiPayload {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiInput {
    pub store_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submit_button: Option<UiButton>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_button: Option<UiButton>,
}

// ---------------------------------------------------------------------------
// Behavioral animation cues
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorAction {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Behavior>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Behavior {
    #[serde(default)]
    pub gestures: Vec<Animation>,
    #[serde(default)]
    pub emotions: Vec<Animation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Animation {
    pub name: String,
    #[serde(default)]
    pub start: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
}

// ---------------------------------------------------------------------------
// Voice data (TTS output)
// ---------------------------------------------------------------------------

/// Audio framing for voice payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioParameters {
    pub channels: u16,
    pub frequency: u32,
    pub sample_bits: u16,
}

impl Default for AudioParameters {
    fn default() -> Self {
        // 16 kHz mono 16-bit PCM
        Self {
            channels: 1,
            frequency: 16_000,
            sample_bits: 16,
        }
    }
}

/// Timing mark inside a synthesized utterance (visemes, word boundaries)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mark {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Decoded synthesized speech returned by a TTS-capable handler
#[derive(Debug, Clone, Default)]
pub struct VoiceData {
    pub data: Vec<u8>,
    pub marks: Vec<Mark>,
    pub audio: AudioParameters,
}

// ---------------------------------------------------------------------------
// Message envelope
// ---------------------------------------------------------------------------

/// The action payload carried inside a conversation message; at most one
/// field is populated per message on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageAction {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<TextAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<Signal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_event: Option<EngineEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_user_store: Option<EndUserStore>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub named_action: Option<NamedAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_action: Option<CustomAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ui_action: Option<UiAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub behavior_action: Option<BehaviorAction>,
}

/// One message of a conversation, as delivered by the engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participant_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<MessageAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instant: Option<DateTime<Utc>>,
}

impl ConversationMessage {
    /// Whether the message originated from the end user (recognized speech
    /// echoes) rather than the being.
    pub fn is_from_end_user(&self) -> bool {
        matches!(self.participant_type.as_deref(), Some("EndUser" | "end-user"))
    }
}

// ---------------------------------------------------------------------------
// Typed inbound actions
// ---------------------------------------------------------------------------

/// Echo of something the end user did, as confirmed by the engine
#[derive(Debug, Clone)]
pub struct UserAction {
    pub text: String,
}

/// Something the being should say/do, paired with synthesized voice when a
/// TTS-capable handler produced one.
#[derive(Debug, Clone, Default)]
pub struct BeingAction {
    pub text: Option<String>,
    pub language: Option<String>,
    pub voice: Option<VoiceData>,
    pub behavior: Option<Behavior>,
}

/// Tagged union of every server-driven event a handler can report.
#[derive(Debug, Clone)]
pub enum InboundAction {
    UserAction(UserAction),
    BeingAction(BeingAction),
    UiAction(UiAction),
    CustomAction(CustomAction),
    BehaviorAction(BehaviorAction),
    EngineEvent(EngineEvent),
    Signal(Signal),
    NamedAction(NamedAction),
    SpeechRecognized(String),
    ConversationInitialized(String),
}

/// Connection lifecycle changes, reported on their own stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Reconnecting,
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_roundtrip_camel_case() {
        let json = r#"{
            "id": "m-1",
            "conversationId": "c-1",
            "participantType": "EndUser",
            "action": {
                "text": { "text": "hello", "speechRecognizedState": "recognized" }
            }
        }"#;
        let msg: ConversationMessage = serde_json::from_str(json).unwrap();
        assert!(msg.is_from_end_user());
        let action = msg.action.unwrap();
        let text = action.text.unwrap();
        assert_eq!(text.text.as_deref(), Some("hello"));
        assert_eq!(text.speech_recognized_state.as_deref(), Some("recognized"));
    }

    #[test]
    fn test_skipped_fields_not_serialized() {
        let msg = ConversationMessage {
            action: Some(MessageAction {
                signal: Some(Signal {
                    name: "conversation-start".to_string(),
                    value: String::new(),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("conversation-start"));
        assert!(!json.contains("uiAction"));
        assert!(!json.contains("behaviorAction"));
    }

    #[test]
    fn test_audio_parameters_default() {
        let audio = AudioParameters::default();
        assert_eq!(audio.channels, 1);
        assert_eq!(audio.frequency, 16_000);
        assert_eq!(audio.sample_bits, 16);
    }
}
