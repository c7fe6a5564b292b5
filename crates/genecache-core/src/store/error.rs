//! Error types for backend operations.

use thiserror::Error;

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors raised inside a storage backend, before they are mapped onto
/// [`crate::error::CacheError`] by the storage facade.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt store file: {0}")]
    Json(#[from] serde_json::Error),

    /// A lock was poisoned by a panicking writer.
    #[error("store lock poisoned")]
    Poisoned,

    /// The blocking task running the operation did not complete.
    #[error("backend task failed: {message}")]
    Task { message: String },
}

impl From<tokio::task::JoinError> for BackendError {
    fn from(e: tokio::task::JoinError) -> Self {
        BackendError::Task {
            message: e.to_string(),
        }
    }
}
