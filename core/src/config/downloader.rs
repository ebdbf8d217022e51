//! Downloads and validates the being-profile configuration document.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};

use crate::auth::HeaderSigner;
use crate::error::{Result, SonaError};

use super::BeingConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Fetches the profile document over HTTP with signed headers.
pub struct ConfigDownloader {
    client: reqwest::Client,
    url: String,
    signer: Arc<dyn HeaderSigner>,
}

impl ConfigDownloader {
    pub fn new(url: impl Into<String>, signer: Arc<dyn HeaderSigner>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            signer,
        })
    }

    /// Download and validate the configuration. Failures here are fatal:
    /// without a valid config no dispatcher can be assembled.
    pub async fn download(&self) -> Result<BeingConfig> {
        let body = self.download_raw().await?;
        BeingConfig::from_json(&body)
    }

    /// Download the raw profile document without validating it.
    pub async fn download_raw(&self) -> Result<String> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        self.signer.sign(&mut headers);

        let response = self
            .client
            .get(&self.url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| SonaError::Http(format!("config download failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SonaError::Http(format!(
                "config download returned {status} for {}",
                self.url
            )));
        }

        let body = response.text().await?;
        tracing::debug!(url = %self.url, bytes = body.len(), "downloaded being config");
        Ok(body)
    }
}
