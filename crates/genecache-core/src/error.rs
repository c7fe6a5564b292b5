//! Error taxonomy for the cache layer.
//!
//! Per-unit analysis failures are not represented here: they are carried by
//! [`crate::scheduler::AnalysisFailure`] and never abort a batch.

use thiserror::Error;

/// Result alias used across the crate.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors surfaced by the key codec, compression middleware, storage and snapshot layers.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A cache key could not be built from its fields (programmer error).
    #[error("cannot encode cache key: {field} {reason}")]
    Encoding { field: &'static str, reason: String },

    /// A value could not be serialized or compressed.
    #[error("unable to compress data: {message}")]
    Compression { message: String },

    /// A stored payload is corrupt.
    #[error("an error occurred when uncompressing data{}: {message}", key_suffix(.key))]
    Decompression { key: Option<String>, message: String },

    /// The configured backend is not present in this environment.
    #[error("storage backend '{backend}' unavailable: {reason}")]
    StorageUnavailable { backend: String, reason: String },

    /// The backend rejected a write.
    #[error("write failed for {key}: {message}")]
    BackendWrite { key: String, message: String },

    /// The backend failed while reading or enumerating.
    #[error("read failed for {key}: {message}")]
    BackendRead { key: String, message: String },

    /// `start` was called while a batch run is still running.
    #[error("a batch run is already in progress (run {run_id})")]
    SchedulerBusy { run_id: u64 },

    /// One or more snapshot entries could not be imported.
    #[error("import failed for {failed} of {total} entries: {first}")]
    ImportFailed {
        failed: usize,
        total: usize,
        first: String,
    },

    /// Invalid configuration.
    #[error("configuration error: {message}")]
    Config { message: String },
}

fn key_suffix(key: &Option<String>) -> String {
    key.as_deref()
        .map(|k| format!(" for key {k}"))
        .unwrap_or_default()
}

impl CacheError {
    pub(crate) fn encoding(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Encoding {
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn decompression(key: Option<&str>, message: impl Into<String>) -> Self {
        Self::Decompression {
            key: key.map(str::to_string),
            message: message.into(),
        }
    }

    /// Stable name of the error kind, used to group repeated failures.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Encoding { .. } => "EncodingError",
            Self::Compression { .. } => "CompressionError",
            Self::Decompression { .. } => "DecompressionError",
            Self::StorageUnavailable { .. } => "StorageUnavailableError",
            Self::BackendWrite { .. } => "BackendWriteError",
            Self::BackendRead { .. } => "BackendReadError",
            Self::SchedulerBusy { .. } => "SchedulerBusy",
            Self::ImportFailed { .. } => "ImportFailed",
            Self::Config { .. } => "ConfigError",
        }
    }

    /// True for errors that make the whole session unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::StorageUnavailable { .. } | Self::Encoding { .. } | Self::Config { .. }
        )
    }

    /// Suggested exit code for CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } => 2,
            Self::StorageUnavailable { .. } => 3,
            Self::ImportFailed { .. } => 4,
            _ => 1,
        }
    }
}
