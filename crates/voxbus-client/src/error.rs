use std::time::Duration;

use thiserror::Error;

use voxbus_state::PatternError;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The transport dropped. Remote clients reconnect in the background.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// No response in time. The request may or may not have been applied.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Server error [{code}]: {message}")]
    Server { code: String, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] PatternError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Whether retrying the same request later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionLost(_) | Self::Timeout(_))
    }
}
