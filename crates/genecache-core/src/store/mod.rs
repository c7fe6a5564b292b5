//! Storage abstraction over the two cache backends.
//!
//! All reads and writes go through [`CacheStorage`], which owns the key codec
//! and compression steps so backends only ever see encoded keys and stored text.
//!
//! # Backends
//!
//! | Backend | Engine | Notes |
//! |---------|--------|-------|
//! | [`FlatStore`] | in-memory map, optional JSON file | shares its key space with unrelated data |
//! | [`IndexedStore`] | SQLite | partitioned by data kind |
//!
//! The backend is chosen once in [`CacheStorage::open`].

pub mod error;
pub mod flat;
pub mod indexed;

use async_trait::async_trait;
use std::sync::{Arc, OnceLock};

pub use error::{BackendError, BackendResult};
pub use flat::FlatStore;
pub use indexed::IndexedStore;

use crate::alerts::ErrorReporter;
use crate::compress::{self, Payload};
use crate::config::{BackendKind, CacheConfig, DEFAULT_OFFLOAD_THRESHOLD_BYTES};
use crate::error::{CacheError, CacheResult};
use crate::key::{CacheKey, DataKind, SessionId};
use crate::worker::{self, DecodeRequest, DecodeWorker, DecodedEntry};

/// Operations every backend provides.
///
/// Backends receive the already encoded key; the structured key is passed
/// along for backends that index on its fields.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Insert or overwrite.
    async fn set(&self, key: &CacheKey, encoded: &str, payload: String) -> BackendResult<()>;

    /// `Ok(None)` when the key is absent.
    async fn get(&self, encoded: &str) -> BackendResult<Option<String>>;

    /// Remove from the `data_kind` partition. Absent keys are not an error.
    async fn remove(&self, data_kind: DataKind, encoded: &str) -> BackendResult<()>;

    /// Every key the backend holds, including foreign keys on shared backends.
    async fn list_all_keys(&self) -> BackendResult<Vec<String>>;

    /// Stored keys of one unit, any session. Backends with a unit index override this.
    async fn list_keys_for_unit(&self, unit_name: &str) -> BackendResult<Vec<String>> {
        Ok(self
            .list_all_keys()
            .await?
            .into_iter()
            .filter(|raw| CacheKey::decode(raw).is_some_and(|k| k.unit_name() == unit_name))
            .collect())
    }
}

/// A decoded key paired with the exact string it is stored under.
///
/// Decoding is lenient (a Coverage key may carry a trailing scheme, a session
/// token may have leading zeros), so re-encoding the decoded key does not
/// always reproduce the stored bytes. Reads and removals use `raw`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredKey {
    pub raw: String,
    pub key: CacheKey,
}

impl StoredKey {
    /// `None` for foreign keys.
    pub fn decode(raw: &str) -> Option<Self> {
        CacheKey::decode(raw).map(|key| Self {
            raw: raw.to_string(),
            key,
        })
    }

    /// The stored key without its app tag and session token.
    pub fn portable(&self) -> &str {
        self.raw
            .splitn(3, crate::key::KEY_DELIM)
            .nth(2)
            .unwrap_or(&self.raw)
    }
}

/// A stored payload together with the key it was read under.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedPayload {
    pub key: String,
    pub payload: Payload,
}

/// Facade over the selected backend.
pub struct CacheStorage {
    backend: Arc<dyn CacheBackend>,
    offload_threshold: usize,
    reporter: Option<Arc<ErrorReporter>>,
    worker: OnceLock<Option<DecodeWorker>>,
}

impl CacheStorage {
    /// Open the backend selected by `config`.
    pub fn open(config: &CacheConfig) -> CacheResult<Self> {
        let backend: Arc<dyn CacheBackend> = match config.effective_backend() {
            BackendKind::Flat => match &config.flat_path {
                Some(path) => Arc::new(FlatStore::open(path).map_err(|e| unavailable("flat", e))?),
                None => Arc::new(FlatStore::memory()),
            },
            BackendKind::Indexed => {
                let path = config
                    .db_path
                    .as_deref()
                    .ok_or_else(|| CacheError::StorageUnavailable {
                        backend: "indexed".into(),
                        reason: "no database path configured (set db_path or GENECACHE_DB)".into(),
                    })?;
                Arc::new(IndexedStore::open(path).map_err(|e| unavailable("indexed", e))?)
            }
        };
        tracing::debug!(backend = backend.name(), "cache storage opened");
        Ok(Self::with_backend(backend, config.offload_threshold_bytes))
    }

    /// Wrap an existing backend.
    pub fn with_backend(backend: Arc<dyn CacheBackend>, offload_threshold: usize) -> Self {
        Self {
            backend,
            offload_threshold,
            reporter: None,
            worker: OnceLock::new(),
        }
    }

    /// In-memory flat store with default settings.
    pub fn memory() -> Self {
        Self::with_backend(Arc::new(FlatStore::memory()), DEFAULT_OFFLOAD_THRESHOLD_BYTES)
    }

    /// Report write failures through `reporter`.
    pub fn with_reporter(mut self, reporter: Arc<ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Store `payload` under `key` and return the encoded key.
    ///
    /// A decoded payload is compressed first; a compressed payload is written
    /// as is. Values with nothing to store (null, empty string) are skipped.
    pub async fn put(&self, key: &CacheKey, payload: Payload) -> CacheResult<String> {
        let encoded = key.encode()?;
        let text = match payload {
            Payload::Compressed(text) => Some(text),
            Payload::Decoded(value) => match compress::compress(&value) {
                Ok(text) => text,
                Err(err) => {
                    self.report(key, &err);
                    return Err(err);
                }
            },
        };
        let Some(text) = text else {
            tracing::debug!(key = %encoded, "nothing to store");
            return Ok(encoded);
        };
        if let Err(e) = self.backend.set(key, &encoded, text).await {
            let err = CacheError::BackendWrite {
                key: encoded,
                message: e.to_string(),
            };
            self.report(key, &err);
            return Err(err);
        }
        Ok(encoded)
    }

    pub async fn get(&self, key: &CacheKey, decompress: bool) -> CacheResult<Option<Payload>> {
        let encoded = key.encode()?;
        self.get_encoded(&encoded, decompress).await
    }

    /// Read by encoded key.
    pub async fn get_encoded(&self, encoded: &str, decompress: bool) -> CacheResult<Option<Payload>> {
        let Some(text) = self.read_raw(encoded).await? else {
            return Ok(None);
        };
        compress::decompress(&text, decompress)
            .map(Some)
            .map_err(|e| with_key(e, encoded))
    }

    pub async fn get_with_key(
        &self,
        key: &CacheKey,
        decompress: bool,
    ) -> CacheResult<Option<KeyedPayload>> {
        let encoded = key.encode()?;
        Ok(self
            .get_encoded(&encoded, decompress)
            .await?
            .map(|payload| KeyedPayload {
                key: encoded,
                payload,
            }))
    }

    /// Read and decode, moving large payloads to the background decode worker.
    pub async fn get_threaded(&self, key: &CacheKey) -> CacheResult<Option<DecodedEntry>> {
        let encoded = key.encode()?;
        self.get_threaded_encoded(&encoded).await
    }

    /// [`Self::get_threaded`] by stored key string.
    pub async fn get_threaded_encoded(&self, encoded: &str) -> CacheResult<Option<DecodedEntry>> {
        let Some(text) = self.read_raw(encoded).await? else {
            return Ok(None);
        };
        let request = DecodeRequest {
            key: encoded.to_string(),
            text,
        };
        if request.text.len() < self.offload_threshold {
            return worker::decode(request).map(Some);
        }
        match self.decode_worker() {
            Some(w) => w.decode(request).await.map(Some),
            None => worker::decode(request).map(Some),
        }
    }

    /// Stored text length of an entry, `None` when absent.
    pub async fn stored_len(&self, encoded: &str) -> CacheResult<Option<usize>> {
        Ok(self.read_raw(encoded).await?.map(|t| t.len()))
    }

    pub async fn remove(&self, data_kind: DataKind, encoded: &str) -> CacheResult<()> {
        self.backend
            .remove(data_kind, encoded)
            .await
            .map_err(|e| CacheError::BackendWrite {
                key: encoded.to_string(),
                message: e.to_string(),
            })
    }

    pub async fn list_all_keys(&self) -> CacheResult<Vec<String>> {
        self.backend
            .list_all_keys()
            .await
            .map_err(|e| CacheError::BackendRead {
                key: "*".into(),
                message: e.to_string(),
            })
    }

    /// Cache keys belonging to `session`, with their stored strings. Foreign keys are skipped.
    pub async fn list_keys_for_session(&self, session: SessionId) -> CacheResult<Vec<StoredKey>> {
        Ok(self
            .list_all_keys()
            .await?
            .iter()
            .filter_map(|raw| StoredKey::decode(raw))
            .filter(|k| k.key.session_id == session)
            .collect())
    }

    pub async fn list_keys_for_unit(
        &self,
        session: SessionId,
        unit_name: &str,
    ) -> CacheResult<Vec<StoredKey>> {
        let raw = self
            .backend
            .list_keys_for_unit(unit_name)
            .await
            .map_err(|e| CacheError::BackendRead {
                key: unit_name.to_string(),
                message: e.to_string(),
            })?;
        Ok(raw
            .iter()
            .filter_map(|raw| StoredKey::decode(raw))
            .filter(|k| k.key.session_id == session && k.key.unit_name() == unit_name)
            .collect())
    }

    async fn read_raw(&self, encoded: &str) -> CacheResult<Option<String>> {
        self.backend
            .get(encoded)
            .await
            .map_err(|e| CacheError::BackendRead {
                key: encoded.to_string(),
                message: e.to_string(),
            })
    }

    fn decode_worker(&self) -> Option<&DecodeWorker> {
        self.worker
            .get_or_init(|| match DecodeWorker::spawn() {
                Ok(w) => Some(w),
                Err(e) => {
                    tracing::warn!(error = %e, "decode worker unavailable, decoding inline");
                    None
                }
            })
            .as_ref()
    }

    fn report(&self, key: &CacheKey, err: &CacheError) {
        match &self.reporter {
            Some(reporter) => reporter.report(key, err),
            None => tracing::warn!(unit = key.unit_name(), "{err}"),
        }
    }
}

fn unavailable(backend: &str, e: BackendError) -> CacheError {
    CacheError::StorageUnavailable {
        backend: backend.to_string(),
        reason: e.to_string(),
    }
}

fn with_key(err: CacheError, encoded: &str) -> CacheError {
    match err {
        CacheError::Decompression { key: None, message } => CacheError::Decompression {
            key: Some(encoded.to_string()),
            message,
        },
        other => other,
    }
}
