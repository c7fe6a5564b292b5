//! Cache configuration.
//!
//! Loaded from an optional YAML file and then overlaid from the environment.
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `GENECACHE_BACKEND` | `flat` or `indexed` (default: `indexed`) |
//! | `GENECACHE_FORCE_FLAT` | `1`/`true` forces the flat store regardless of `backend` |
//! | `GENECACHE_DB` | SQLite file for the indexed store |
//! | `GENECACHE_FLAT_FILE` | JSON file backing the flat store (in-memory when unset) |
//! | `GENECACHE_BATCH_SIZE` | Units analyzed concurrently (default: 5) |
//! | `GENECACHE_EXPIRATION_HOURS` | Age at which a session counts as old (default: 24) |
//! | `GENECACHE_KEEP_CACHE` | Keep the current session when asked to clear it |

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CacheError, CacheResult};

pub const DEFAULT_BATCH_SIZE: usize = 5;
pub const DEFAULT_EXPIRATION_HOURS: u64 = 24;
/// Payloads at or above this many bytes are decoded off the calling task.
pub const DEFAULT_OFFLOAD_THRESHOLD_BYTES: usize = 64 * 1024;
/// Occurrences of the same failure shown as warnings before escalating.
pub const DEFAULT_WARN_LIMIT: u32 = 3;
/// Occurrences after which the same failure is no longer surfaced.
pub const DEFAULT_SUPPRESS_AFTER: u32 = 8;

/// Which storage engine backs the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Synchronous flat key/value map shared with unrelated data.
    Flat,
    /// SQLite store partitioned by data kind.
    #[default]
    Indexed,
}

impl BackendKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "flat" | "local" | "local_storage" => Some(BackendKind::Flat),
            "indexed" | "indexeddb" | "sqlite" => Some(BackendKind::Indexed),
            _ => None,
        }
    }
}

/// Thresholds for repeated-failure alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub warn_limit: u32,
    pub suppress_after: u32,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            warn_limit: DEFAULT_WARN_LIMIT,
            suppress_after: DEFAULT_SUPPRESS_AFTER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: BackendKind,
    /// Override that always selects the flat store.
    pub force_flat: bool,
    pub db_path: Option<PathBuf>,
    pub flat_path: Option<PathBuf>,
    pub batch_size: usize,
    pub expiration_hours: u64,
    pub keep_cache: bool,
    pub offload_threshold_bytes: usize,
    pub alerts: AlertThresholds,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            force_flat: false,
            db_path: None,
            flat_path: None,
            batch_size: DEFAULT_BATCH_SIZE,
            expiration_hours: DEFAULT_EXPIRATION_HOURS,
            keep_cache: false,
            offload_threshold_bytes: DEFAULT_OFFLOAD_THRESHOLD_BYTES,
            alerts: AlertThresholds::default(),
        }
    }
}

impl CacheConfig {
    /// Flat store held in memory; used by tests and tools.
    pub fn in_memory() -> Self {
        Self {
            backend: BackendKind::Flat,
            ..Self::default()
        }
    }

    /// Load from a YAML file, then apply environment overrides.
    pub fn load(path: &Path) -> CacheResult<Self> {
        Self::load_with(path, |name| env::var(name).ok())
    }

    /// [`Self::load`] with overrides from an arbitrary lookup.
    pub fn load_with<F>(path: &Path, lookup: F) -> CacheResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = std::fs::read_to_string(path).map_err(|e| CacheError::Config {
            message: format!("failed to read {}: {}", path.display(), e),
        })?;
        let cfg: CacheConfig = serde_yaml::from_str(&text).map_err(|e| CacheError::Config {
            message: format!("failed to parse {}: {}", path.display(), e),
        })?;
        cfg.with_overrides(lookup)?.validated()
    }

    /// Defaults overlaid from the environment.
    pub fn from_env() -> CacheResult<Self> {
        Self::default().with_env_overrides()?.validated()
    }

    pub fn with_env_overrides(self) -> CacheResult<Self> {
        self.with_overrides(|name| env::var(name).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in production).
    pub fn with_overrides<F>(mut self, lookup: F) -> CacheResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("GENECACHE_BACKEND") {
            self.backend = BackendKind::parse(&v).ok_or_else(|| CacheError::Config {
                message: format!("GENECACHE_BACKEND: unknown backend '{v}'"),
            })?;
        }
        if let Some(v) = lookup("GENECACHE_FORCE_FLAT") {
            self.force_flat = parse_flag(&v);
        }
        if let Some(v) = lookup("GENECACHE_DB") {
            self.db_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("GENECACHE_FLAT_FILE") {
            self.flat_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("GENECACHE_BATCH_SIZE") {
            self.batch_size = parse_number("GENECACHE_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("GENECACHE_EXPIRATION_HOURS") {
            self.expiration_hours = parse_number("GENECACHE_EXPIRATION_HOURS", &v)?;
        }
        if let Some(v) = lookup("GENECACHE_KEEP_CACHE") {
            self.keep_cache = parse_flag(&v);
        }
        Ok(self)
    }

    pub fn validated(self) -> CacheResult<Self> {
        if self.batch_size == 0 {
            return Err(CacheError::Config {
                message: "batch_size must be at least 1".into(),
            });
        }
        if self.alerts.warn_limit > self.alerts.suppress_after {
            return Err(CacheError::Config {
                message: format!(
                    "alerts.warn_limit ({}) must not exceed alerts.suppress_after ({})",
                    self.alerts.warn_limit, self.alerts.suppress_after
                ),
            });
        }
        Ok(self)
    }

    /// Backend after applying the `force_flat` override.
    pub fn effective_backend(&self) -> BackendKind {
        if self.force_flat {
            BackendKind::Flat
        } else {
            self.backend
        }
    }

    pub fn expiration(&self) -> Duration {
        hours(self.expiration_hours)
    }
}

/// `h` hours, saturating instead of overflowing.
pub fn hours(h: u64) -> Duration {
    Duration::from_secs(h.saturating_mul(60 * 60))
}

fn parse_flag(v: &str) -> bool {
    matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn parse_number<T: std::str::FromStr>(name: &str, v: &str) -> CacheResult<T> {
    v.trim().parse::<T>().map_err(|_| CacheError::Config {
        message: format!("{name}: expected a number, got '{v}'"),
    })
}
