use thiserror::Error;

use crate::registry::RuleError;

#[derive(Debug, Error)]
pub enum VoxbusError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Rule error: {0}")]
    Rules(#[from] RuleError),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, VoxbusError>;
