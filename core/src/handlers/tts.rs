//! Fallback speech-synthesis handler over signed HTTP.
//!
//! One POST per synthesis request; there is no connection to keep alive, so
//! `prepare` only pins the session and `clear_processing_queue` has nothing
//! to cancel (requests already on the wire run to completion).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};

use crate::action::{AudioParameters, Mark, VoiceData};
use crate::auth::HeaderSigner;
use crate::error::{Result, SonaError};
use crate::handler::{ActionRequest, Capability, CommunicationHandler, DisposeHook};
use crate::session::Session;

use async_trait::async_trait;

const NAME: &str = "tts-http";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SynthesisRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    language: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    location_id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SynthesisResponse {
    /// Base64-encoded PCM payload.
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    marks: Vec<Mark>,
    #[serde(default)]
    audio_parameters: Option<AudioParameters>,
}

pub struct TtsHttpHandler {
    client: reqwest::Client,
    url: String,
    signer: Arc<dyn HeaderSigner>,
    location_id: Option<String>,
    audio: AudioParameters,
    prepared: AtomicBool,
    disposed: AtomicBool,
    dispose_hook: DisposeHook,
}

impl TtsHttpHandler {
    pub fn new(
        url: String,
        signer: Arc<dyn HeaderSigner>,
        location_id: Option<String>,
        audio: AudioParameters,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            signer,
            location_id,
            audio,
            prepared: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            dispose_hook: DisposeHook::new(),
        }
    }

    async fn synthesize(
        &self,
        text: &str,
        language: Option<&str>,
        voice: Option<&str>,
    ) -> Result<VoiceData> {
        let body = SynthesisRequest {
            text,
            language,
            voice,
            location_id: self.location_id.as_deref(),
        };

        let mut headers = reqwest::header::HeaderMap::new();
        self.signer.sign(&mut headers);

        let response = self
            .client
            .post(&self.url)
            .timeout(REQUEST_TIMEOUT)
            .headers(headers)
            .header(ACCEPT, "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SonaError::Http(format!(
                "tts request to {} failed with status {status}",
                self.url
            )));
        }

        let parsed: SynthesisResponse = response.json().await?;
        let data = match parsed.data {
            Some(encoded) => base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| {
                    SonaError::action(Capability::ProcessTts, format!("invalid audio payload: {e}"))
                })?,
            None => Vec::new(),
        };

        Ok(VoiceData {
            data,
            marks: parsed.marks,
            audio: parsed.audio_parameters.unwrap_or(self.audio),
        })
    }
}

#[async_trait]
impl CommunicationHandler for TtsHttpHandler {
    fn name(&self) -> &str {
        NAME
    }

    fn has_capability(&self, capability: Capability) -> bool {
        capability == Capability::ProcessTts
    }

    fn is_prepared(&self) -> bool {
        self.prepared.load(Ordering::SeqCst)
    }

    async fn prepare(&self, _session: Arc<Session>) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(SonaError::connection(NAME, "handler disposed"));
        }
        // Stateless per request; nothing to hand-shake.
        self.prepared.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn make_action(&self, request: ActionRequest) -> Result<()> {
        if !self.prepared.load(Ordering::SeqCst) {
            return Err(SonaError::action(
                Capability::ProcessTts,
                "handler is not prepared",
            ));
        }
        match request {
            ActionRequest::Tts(mut job) => {
                let voice = self
                    .synthesize(&job.text, job.language.as_deref(), job.voice.as_deref())
                    .await?;
                if let Some(reply) = job.reply.take() {
                    let _ = reply.send(voice);
                }
                Ok(())
            }
            other => Err(SonaError::action(
                other.capability(),
                "not served by the tts handler",
            )),
        }
    }

    fn clear_processing_queue(&self) {}

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.prepared.store(false, Ordering::SeqCst);
        self.dispose_hook.run();
        tracing::debug!("tts handler disposed");
    }
}
