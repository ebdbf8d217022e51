//! Conversation session identity and its persistence collaborator.
//!
//! A [`Session`] is created when a conversation starts and replaced wholesale
//! on the next one; nothing ever mutates it in place, so events from a
//! draining old conversation can never observe a half-updated session.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SonaError};

/// Identity of the current conversation. Owned by the dispatcher, shared
/// read-only with handlers via `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub end_user_id: Uuid,
    /// Assigned/confirmed by the server; `None` until then.
    pub conversation_id: Option<String>,
}

impl Session {
    pub fn new(end_user_id: Uuid, conversation_id: Option<String>) -> Self {
        Self {
            end_user_id,
            conversation_id,
        }
    }
}

/// Snapshot of session identifiers worth keeping across process restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSession {
    pub end_user_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

/// Persistence collaborator for session identifiers. The communication core
/// never touches storage directly; the being facade consults the store when
/// a conversation starts or is confirmed.
///
/// `save` and `clear` are best-effort: persistence failures are logged, not
/// propagated, since losing a stored id only costs conversation continuity.
pub trait SessionStore: Send + Sync {
    fn load(&self) -> Option<StoredSession>;
    fn save(&self, session: &StoredSession);
    fn clear(&self);
}

/// JSON-file-backed store under the platform data directory.
pub struct JsonFileSessionStore {
    path: PathBuf,
}

impl JsonFileSessionStore {
    pub fn new() -> Result<Self> {
        let path = dirs::data_dir()
            .ok_or_else(|| SonaError::configuration("could not find data directory"))?
            .join("sona")
            .join("session.json");
        Ok(Self { path })
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }
}

impl SessionStore for JsonFileSessionStore {
    fn load(&self) -> Option<StoredSession> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&content) {
            Ok(session) => Some(session),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "ignoring corrupt session file: {e}");
                None
            }
        }
    }

    fn save(&self, session: &StoredSession) {
        let write = || -> Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let content = serde_json::to_string_pretty(session)?;
            std::fs::write(&self.path, content)?;
            Ok(())
        };
        if let Err(e) = write() {
            tracing::warn!(path = %self.path.display(), "failed to persist session: {e}");
        }
    }

    fn clear(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// In-memory store for tests and embedders that manage persistence upstream.
#[derive(Default)]
pub struct MemorySessionStore {
    inner: parking_lot::Mutex<Option<StoredSession>>,
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Option<StoredSession> {
        self.inner.lock().clone()
    }

    fn save(&self, session: &StoredSession) {
        *self.inner.lock() = Some(session.clone());
    }

    fn clear(&self) {
        *self.inner.lock() = None;
    }
}
