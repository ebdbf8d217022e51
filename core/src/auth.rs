//! Credential/header signing collaborator.
//!
//! Handlers never build authentication headers themselves; they hand a
//! mutable header map to the signer right before any request or handshake.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

const PROFILE_ID_HEADER: &str = "x-profile-id";
const PROFILE_SECRET_HEADER: &str = "x-profile-secret";
const APP_IDENTIFIER_HEADER: &str = "x-app-identifier";

/// Injects authentication headers into an outgoing request.
pub trait HeaderSigner: Send + Sync {
    fn sign(&self, headers: &mut HeaderMap);
}

/// Signs requests with the profile credentials and the application
/// identifier the backend expects on every call.
#[derive(Debug, Clone)]
pub struct ProfileSigner {
    app_identifier: String,
    profile_id: String,
    profile_secret: String,
}

impl ProfileSigner {
    pub fn new(
        app_identifier: impl Into<String>,
        profile_id: impl Into<String>,
        profile_secret: impl Into<String>,
    ) -> Self {
        Self {
            app_identifier: app_identifier.into(),
            profile_id: profile_id.into(),
            profile_secret: profile_secret.into(),
        }
    }
}

impl HeaderSigner for ProfileSigner {
    fn sign(&self, headers: &mut HeaderMap) {
        insert(headers, APP_IDENTIFIER_HEADER, &self.app_identifier);
        insert(headers, PROFILE_ID_HEADER, &self.profile_id);
        insert(headers, PROFILE_SECRET_HEADER, &self.profile_secret);
    }
}

/// Signer that leaves requests untouched, for local stubs and tests.
#[derive(Debug, Clone, Default)]
pub struct NoopSigner;

impl HeaderSigner for NoopSigner {
    fn sign(&self, _headers: &mut HeaderMap) {}
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    } else {
        tracing::warn!(header = name, "skipping header with non-ASCII value");
    }
}
