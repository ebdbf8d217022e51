//! Structured error types for the sona communication core.
//!
//! Errors fall into a small taxonomy: configuration problems are fatal and
//! raised while the dispatcher is being assembled, connection problems abort
//! a session initialization attempt, and action problems stay local to the
//! request that produced them.

use thiserror::Error;

/// Primary error type for the communication core
#[derive(Error, Debug)]
pub enum SonaError {
    // =========================================================================
    // Configuration Errors (fatal, raised at construction)
    // =========================================================================
    /// Invalid or inconsistent being configuration
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// A fallback engine binding names a protocol no handler implements
    #[error("unsupported protocol '{protocol}' for {engine} engine")]
    UnsupportedProtocol { engine: String, protocol: String },

    // =========================================================================
    // Session / Transport Errors
    // =========================================================================
    /// A handler failed to establish its transport during session setup
    #[error("connection failed ({handler}): {message}")]
    Connection { handler: String, message: String },

    /// A single outgoing request failed; the session stays usable
    #[error("action failed ({capability}): {message}")]
    Action { capability: String, message: String },

    /// Operation attempted before a successful `initialize_with`
    #[error("communication dispatcher is not initialized")]
    NotInitialized,

    /// Operation attempted after the dispatcher was disposed
    #[error("communication dispatcher has been disposed")]
    Disposed,

    // =========================================================================
    // External Error Wrappers
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

impl SonaError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn connection(handler: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Connection {
            handler: handler.into(),
            message: message.to_string(),
        }
    }

    pub fn action(capability: impl std::fmt::Display, message: impl std::fmt::Display) -> Self {
        Self::Action {
            capability: capability.to_string(),
            message: message.to_string(),
        }
    }

    /// Fatal errors prevent the dispatcher from ever becoming usable
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. } | Self::UnsupportedProtocol { .. }
        )
    }

    /// Check if the error is transient and a retry may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Http(_) => true,
            Self::Io(io_err) => matches!(
                io_err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            Self::Configuration { .. } | Self::UnsupportedProtocol { .. } => {
                "The being profile is misconfigured. Please verify the profile settings."
                    .to_string()
            }
            Self::Connection { .. } => {
                "Could not reach the conversation service. Please try again.".to_string()
            }
            Self::Action { .. } => "The last request failed. Retry is possible.".to_string(),
            Self::NotInitialized => "Start a conversation first.".to_string(),
            _ => self.to_string(),
        }
    }
}

impl From<serde_json::Error> for SonaError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

impl From<reqwest::Error> for SonaError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

/// Result type alias using SonaError
pub type Result<T> = std::result::Result<T, SonaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        assert!(SonaError::configuration("bad engine").is_fatal());
        assert!(SonaError::UnsupportedProtocol {
            engine: "stt".to_string(),
            protocol: "local".to_string(),
        }
        .is_fatal());
        assert!(!SonaError::NotInitialized.is_fatal());
    }

    #[test]
    fn test_retryable_errors() {
        assert!(SonaError::connection("conversation-socket", "timed out").is_retryable());
        assert!(!SonaError::action("send-text", "rejected").is_retryable());
        assert!(!SonaError::Disposed.is_retryable());
    }

    #[test]
    fn test_user_messages() {
        let err = SonaError::NotInitialized;
        assert!(err.user_message().contains("Start a conversation"));

        let err = SonaError::connection("tts-http", "refused");
        assert!(err.user_message().contains("Could not reach"));
    }
}
