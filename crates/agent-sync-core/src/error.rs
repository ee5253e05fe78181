use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncEngineError {
    #[error("Invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    #[error("A sync run is already in progress ({0})")]
    AlreadyRunning(String),

    #[error("Remote connection unavailable: {0}")]
    ConnectionUnavailable(String),
    #[error("Transfer failed for {label}: {message}")]
    ItemTransferFailed { label: String, message: String },
    #[error("Run cancelled")]
    Cancelled,

    #[error("Transfer tool unavailable: {0}")]
    TransferToolUnavailable(String),

    #[error("Key unreadable at {path}: {reason}")]
    KeyUnreadable { path: PathBuf, reason: String },
    #[error("Key generation failed: {0}")]
    KeyGenerationFailed(String),

    #[error("No run recorded with id {0}")]
    HistoryNotFound(String),

    #[error("Share content is empty")]
    ShareContentEmpty,
    #[error("Share server failed: {0}")]
    ShareServerFailed(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported platform operation: {0}")]
    Unsupported(String),
}

impl SyncEngineError {
    pub fn invalid_config(issue: impl Into<String>) -> Self {
        Self::InvalidConfig(vec![issue.into()])
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn key_unreadable(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::KeyUnreadable {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
