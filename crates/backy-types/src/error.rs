use thiserror::Error;

pub type Result<T> = std::result::Result<T, BackyError>;

/// Error kinds surfaced by the backup engine.
///
/// `Network` and `Transfer` are transient and subject to the bounded retry
/// policy; everything else is permanent and fails the job immediately.
#[derive(Debug, Error)]
pub enum BackyError {
    #[error("source not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("transfer error: {0}")]
    Transfer(String),

    #[error("snapshot backend error: {0}")]
    Repository(String),

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("job cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BackyError {
    /// Whether this error is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackyError::Network(_) | BackyError::Transfer(_))
    }
}
