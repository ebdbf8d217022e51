//! Raw wire shape of the downloaded being-profile document.
//!
//! These structs only describe the JSON; validation into [`BeingConfig`]
//! happens in the parent module.
//!
//! [`BeingConfig`]: super::BeingConfig

use serde::Deserialize;

use crate::action::AudioParameters;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub profile: Option<ProfileSection>,
    #[serde(default)]
    pub engines: Option<EnginesSection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSection {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub touchpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnginesSection {
    #[serde(rename = "convAi", default)]
    pub conversation: Option<EngineSection>,
    #[serde(default)]
    pub stt: Option<AudioEngineSection>,
    #[serde(default)]
    pub tts: Option<AudioEngineSection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSection {
    #[serde(default)]
    pub connection_handlers: Vec<ConnectionHandlerEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioEngineSection {
    #[serde(default)]
    pub connection_handlers: Vec<ConnectionHandlerEntry>,
    #[serde(default)]
    pub audio_parameters: Vec<AudioParameters>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionHandlerEntry {
    pub path: String,
    pub protocol: String,
}
