//! Exit codes of the `genecache` binary.
//! These codes are part of the public contract.

use genecache_core::CacheError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1; // Operation failed (backend read/write, corrupt data)
pub const CONFIG_ERROR: i32 = 2; // Invalid configuration or arguments
pub const STORAGE_UNAVAILABLE: i32 = 3; // Backend could not be opened
pub const PARTIAL: i32 = 4; // Some entries failed (import, eviction)

/// Map an error chain to an exit code, using the cache error when there is one.
pub fn for_error(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<CacheError>() {
        Some(CacheError::Config { .. }) => CONFIG_ERROR,
        Some(CacheError::StorageUnavailable { .. }) => STORAGE_UNAVAILABLE,
        Some(CacheError::ImportFailed { .. }) => PARTIAL,
        Some(e) => e.exit_code(),
        None => FAILURE,
    }
}
