//! `GeneCache`: one handle over storage, sessions, snapshots and the scheduler.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::alerts::ErrorReporter;
use crate::compress::Payload;
use crate::config::CacheConfig;
use crate::error::CacheResult;
use crate::events::EventSink;
use crate::key::{CacheKey, DataKind, KeyFields, SessionId};
use crate::scheduler::{AnalysisPipeline, BatchScheduler};
use crate::session::{EvictionReport, SessionManager};
use crate::snapshot::{self, ExportOptions, ImportOptions, ImportReport, SnapshotEntry, SummaryObserver};
use crate::store::{CacheStorage, StoredKey};

/// Rebuilds derived per-unit state from cached variant data.
#[async_trait]
pub trait SummaryRefresher: Send + Sync {
    async fn refresh(&self, key: &CacheKey, data: Value) -> anyhow::Result<()>;
}

pub struct GeneCache {
    config: CacheConfig,
    storage: Arc<CacheStorage>,
    reporter: Arc<ErrorReporter>,
    sessions: SessionManager,
    sink: EventSink,
}

impl GeneCache {
    /// Open the configured backend for `session`.
    pub fn open(config: CacheConfig, session: SessionId, sink: EventSink) -> CacheResult<Self> {
        let storage = CacheStorage::open(&config)?;
        Ok(Self::with_storage(config, session, storage, sink))
    }

    pub fn with_storage(
        config: CacheConfig,
        session: SessionId,
        storage: CacheStorage,
        sink: EventSink,
    ) -> Self {
        let reporter = Arc::new(ErrorReporter::new(config.alerts, sink.clone()));
        let storage = Arc::new(storage.with_reporter(reporter.clone()));
        let sessions = SessionManager::new(
            storage.clone(),
            session,
            config.expiration(),
            config.keep_cache,
        );
        Self {
            config,
            storage,
            reporter,
            sessions,
            sink,
        }
    }

    pub fn session(&self) -> SessionId {
        self.sessions.current()
    }

    /// Switch to a new session; repeated-failure counts start over.
    pub fn start_session(&mut self, session: SessionId) {
        self.sessions.set_current(session);
        self.reporter.reset();
        tracing::info!(session = %session, label = %session.label(), "cache session started");
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<CacheStorage> {
        &self.storage
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn reporter(&self) -> &Arc<ErrorReporter> {
        &self.reporter
    }

    /// Key for `fields` in the current session.
    pub fn key(&self, fields: KeyFields) -> CacheKey {
        CacheKey::new(self.session(), fields)
    }

    pub async fn put(&self, fields: KeyFields, value: Value) -> CacheResult<String> {
        self.storage.put(&self.key(fields), Payload::Decoded(value)).await
    }

    pub async fn get(&self, fields: KeyFields) -> CacheResult<Option<Value>> {
        Ok(self
            .storage
            .get(&self.key(fields), true)
            .await?
            .and_then(Payload::into_value))
    }

    /// Scheduler sized from the configured batch capacity.
    pub fn scheduler(&self, pipeline: Arc<dyn AnalysisPipeline>) -> BatchScheduler {
        BatchScheduler::new(self.config.batch_size, pipeline, self.sink.clone())
    }

    pub async fn export(&self, options: &ExportOptions) -> CacheResult<Vec<SnapshotEntry>> {
        snapshot::export(&self.storage, self.session(), options).await
    }

    pub async fn import(
        &self,
        bundle: Vec<SnapshotEntry>,
        already_compressed: bool,
        options: &ImportOptions,
        observer: Option<&dyn SummaryObserver>,
    ) -> CacheResult<ImportReport> {
        snapshot::import(
            &self.storage,
            self.session(),
            bundle,
            already_compressed,
            options,
            observer,
        )
        .await
    }

    /// Remove every current-session entry of one unit and drop it from the running batch.
    pub async fn clear_unit(
        &self,
        unit_name: &str,
        scheduler: Option<&BatchScheduler>,
    ) -> CacheResult<EvictionReport> {
        let session = self.session();
        let mut report = EvictionReport {
            session_id: session,
            removed: 0,
            failures: Vec::new(),
        };
        for stored in self.storage.list_keys_for_unit(session, unit_name).await? {
            match self.storage.remove(stored.key.data_kind(), &stored.raw).await {
                Ok(()) => report.removed += 1,
                Err(e) => report.failures.push((stored.raw, e.to_string())),
            }
        }
        if let Some(scheduler) = scheduler {
            if scheduler.is_in_progress(unit_name) {
                scheduler.release(unit_name);
            }
        }
        Ok(report)
    }

    /// Feed every cached proband variant payload of `units` through `refresher`.
    ///
    /// Decoding uses the background worker; a unit whose payload fails to decode
    /// or refresh is logged and skipped. Returns how many units were refreshed.
    pub async fn refresh_summaries(
        &self,
        units: &[String],
        refresher: &dyn SummaryRefresher,
    ) -> CacheResult<usize> {
        let keys: Vec<StoredKey> = self
            .storage
            .list_keys_for_session(self.session())
            .await?
            .into_iter()
            .filter(|k| {
                k.key.data_kind() == DataKind::RawVariants
                    && k.key.relationship() == "proband"
                    && units.iter().any(|u| u == k.key.unit_name())
            })
            .collect();

        let mut refreshed = 0;
        for StoredKey { raw, key } in keys {
            let entry = match self.storage.get_threaded_encoded(&raw).await {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(unit = key.unit_name(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            match refresher.refresh(&key, entry.value).await {
                Ok(()) => refreshed += 1,
                Err(e) => tracing::warn!(unit = key.unit_name(), error = %e, "summary refresh failed"),
            }
        }
        Ok(refreshed)
    }
}
