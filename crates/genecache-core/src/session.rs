//! Session classification, size accounting and eviction.
//!
//! Sessions are never stored as records; they are derived on demand by
//! decoding every key in the backend and grouping by session id.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::CacheResult;
use crate::key::{CacheKey, DataKind, SessionId};
use crate::store::{CacheStorage, StoredKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionClass {
    Current,
    Recent,
    Old,
}

/// Class of one session. Age equal to `expiration` counts as old.
pub fn classify_session(
    session: SessionId,
    now: SessionId,
    current: SessionId,
    expiration: Duration,
) -> SessionClass {
    if session == current {
        return SessionClass::Current;
    }
    let expiration_ms = i64::try_from(expiration.as_millis()).unwrap_or(i64::MAX);
    if session.age_at(now) < expiration_ms {
        SessionClass::Recent
    } else {
        SessionClass::Old
    }
}

/// Keys grouped by session class. Keys that do not decode are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionClassification {
    pub current: Vec<StoredKey>,
    pub recent: BTreeMap<SessionId, Vec<StoredKey>>,
    pub old: BTreeMap<SessionId, Vec<StoredKey>>,
}

impl SessionClassification {
    pub fn old_sessions(&self) -> Vec<SessionId> {
        self.old.keys().copied().collect()
    }

    pub fn recent_sessions(&self) -> Vec<SessionId> {
        self.recent.keys().copied().collect()
    }
}

pub fn classify<S: AsRef<str>>(
    keys: &[S],
    now: SessionId,
    current: SessionId,
    expiration: Duration,
) -> SessionClassification {
    let mut out = SessionClassification::default();
    for stored in keys.iter().filter_map(|k| StoredKey::decode(k.as_ref())) {
        let session = stored.key.session_id;
        match classify_session(session, now, current, expiration) {
            SessionClass::Current => out.current.push(stored),
            SessionClass::Recent => out.recent.entry(session).or_default().push(stored),
            SessionClass::Old => out.old.entry(session).or_default().push(stored),
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionLabel {
    pub session_id: SessionId,
    pub label: String,
}

impl SessionLabel {
    fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            label: session_id.label(),
        }
    }
}

/// Stored bytes per session class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SizeReport {
    pub current_session: SessionId,
    pub current_bytes: u64,
    pub recent_bytes: u64,
    pub recent_sessions: Vec<SessionLabel>,
    pub old_bytes: u64,
    pub old_sessions: Vec<SessionLabel>,
}

impl SizeReport {
    /// Bytes as megabytes rounded to two decimals.
    pub fn megabytes(bytes: u64) -> f64 {
        let mb = bytes as f64 / (1024.0 * 1024.0);
        (mb * 100.0).round() / 100.0
    }

    pub fn total_bytes(&self) -> u64 {
        self.current_bytes + self.recent_bytes + self.old_bytes
    }
}

/// Outcome of removing every key of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    pub session_id: SessionId,
    pub removed: usize,
    /// `(key, error)` for every removal that failed.
    pub failures: Vec<(String, String)>,
}

impl EvictionReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Which entries to list in a contents report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyFilter {
    pub relationship: Option<String>,
    pub unit_name: Option<String>,
    pub data_kind: Option<DataKind>,
    /// Include every session instead of only the current one.
    pub all_sessions: bool,
}

impl KeyFilter {
    pub fn matches(&self, key: &CacheKey) -> bool {
        self.relationship
            .as_deref()
            .map_or(true, |r| key.relationship() == r)
            && self.unit_name.as_deref().map_or(true, |u| key.unit_name() == u)
            && self.data_kind.map_or(true, |k| key.data_kind() == k)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContentsEntry {
    pub key: String,
    pub data_kind: DataKind,
    /// Stored payload length plus key length.
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContentsReport {
    pub entries: Vec<ContentsEntry>,
    pub by_kind: BTreeMap<DataKind, u64>,
    pub total_bytes: u64,
}

/// Remove every key of `session`. Each removal is attempted; failures are collected.
pub async fn evict_session(storage: &CacheStorage, session: SessionId) -> CacheResult<EvictionReport> {
    let keys = storage.list_keys_for_session(session).await?;
    let mut report = EvictionReport {
        session_id: session,
        removed: 0,
        failures: Vec::new(),
    };
    for stored in keys {
        match storage.remove(stored.key.data_kind(), &stored.raw).await {
            Ok(()) => report.removed += 1,
            Err(e) => {
                tracing::warn!(key = %stored.raw, error = %e, "failed to evict cache entry");
                report.failures.push((stored.raw, e.to_string()));
            }
        }
    }
    tracing::info!(
        session = %session,
        removed = report.removed,
        failed = report.failures.len(),
        "session evicted"
    );
    Ok(report)
}

pub struct SessionManager {
    storage: Arc<CacheStorage>,
    current: SessionId,
    expiration: Duration,
    keep_cache: bool,
}

impl SessionManager {
    pub fn new(
        storage: Arc<CacheStorage>,
        current: SessionId,
        expiration: Duration,
        keep_cache: bool,
    ) -> Self {
        Self {
            storage,
            current,
            expiration,
            keep_cache,
        }
    }

    pub fn current(&self) -> SessionId {
        self.current
    }

    pub fn set_current(&mut self, session: SessionId) {
        self.current = session;
    }

    pub fn expiration(&self) -> Duration {
        self.expiration
    }

    pub async fn classification_at(&self, now: SessionId) -> CacheResult<SessionClassification> {
        let keys = self.storage.list_all_keys().await?;
        Ok(classify(&keys, now, self.current, self.expiration))
    }

    pub async fn size_report(&self) -> CacheResult<SizeReport> {
        self.size_report_at(SessionId::now()).await
    }

    pub async fn size_report_at(&self, now: SessionId) -> CacheResult<SizeReport> {
        let classes = self.classification_at(now).await?;
        let current_bytes = self.sum_bytes(&classes.current).await?;
        let mut recent_bytes = 0;
        for keys in classes.recent.values() {
            recent_bytes += self.sum_bytes(keys).await?;
        }
        let mut old_bytes = 0;
        for keys in classes.old.values() {
            old_bytes += self.sum_bytes(keys).await?;
        }
        Ok(SizeReport {
            current_session: self.current,
            current_bytes,
            recent_bytes,
            recent_sessions: classes.recent.keys().copied().map(SessionLabel::new).collect(),
            old_bytes,
            old_sessions: classes.old.keys().copied().map(SessionLabel::new).collect(),
        })
    }

    async fn sum_bytes(&self, keys: &[StoredKey]) -> CacheResult<u64> {
        let mut total = 0u64;
        for stored in keys {
            total += self.storage.stored_len(&stored.raw).await?.unwrap_or(0) as u64;
        }
        Ok(total)
    }

    pub async fn evict_session(&self, session: SessionId) -> CacheResult<EvictionReport> {
        evict_session(&self.storage, session).await
    }

    /// Evict every session at least `expiration` old.
    pub async fn evict_older_than(&self, expiration: Duration) -> CacheResult<Vec<EvictionReport>> {
        self.evict_older_than_at(expiration, SessionId::now()).await
    }

    pub async fn evict_older_than_at(
        &self,
        expiration: Duration,
        now: SessionId,
    ) -> CacheResult<Vec<EvictionReport>> {
        let keys = self.storage.list_all_keys().await?;
        let classes = classify(&keys, now, self.current, expiration);
        let mut reports = Vec::with_capacity(classes.old.len());
        for session in classes.old_sessions() {
            reports.push(evict_session(&self.storage, session).await?);
        }
        Ok(reports)
    }

    /// Clear the current session unless the cache is configured to be kept.
    pub async fn clear_current(&self) -> CacheResult<Option<EvictionReport>> {
        if self.keep_cache {
            tracing::debug!(session = %self.current, "keep_cache set, not clearing");
            return Ok(None);
        }
        evict_session(&self.storage, self.current).await.map(Some)
    }

    pub async fn contents(&self, filter: &KeyFilter) -> CacheResult<ContentsReport> {
        let mut report = ContentsReport::default();
        for raw in self.storage.list_all_keys().await? {
            let Some(key) = CacheKey::decode(&raw) else {
                continue;
            };
            if !filter.all_sessions && key.session_id != self.current {
                continue;
            }
            if !filter.matches(&key) {
                continue;
            }
            let bytes = match self.storage.stored_len(&raw).await? {
                Some(len) => (len + raw.len()) as u64,
                None => 0,
            };
            *report.by_kind.entry(key.data_kind()).or_default() += bytes;
            report.total_bytes += bytes;
            report.entries.push(ContentsEntry {
                key: raw,
                data_kind: key.data_kind(),
                bytes,
            });
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::Payload;
    use crate::key::KeyFields;
    use crate::store::FlatStore;

    const HOUR_MS: i64 = 60 * 60 * 1000;

    fn key(session: i64, unit: &str, kind: DataKind) -> CacheKey {
        CacheKey::new(
            SessionId(session),
            KeyFields::new("proband", "s1", unit, "T1", kind, Some("vep".into())),
        )
    }

    #[test]
    fn boundary_is_old() {
        let now = SessionId(100 * HOUR_MS);
        let current = now;
        let exp = Duration::from_secs(24 * 3600);
        assert_eq!(
            classify_session(SessionId(now.0 - 24 * HOUR_MS), now, current, exp),
            SessionClass::Old
        );
        assert_eq!(
            classify_session(SessionId(now.0 - 24 * HOUR_MS + 1), now, current, exp),
            SessionClass::Recent
        );
        assert_eq!(classify_session(current, now, current, exp), SessionClass::Current);
    }

    #[test]
    fn classify_skips_foreign_keys() {
        let now = SessionId(100 * HOUR_MS);
        let keys = vec![
            "theme^dark".to_string(),
            key(now.0, "A", DataKind::Coverage).encode().unwrap(),
            key(now.0 - HOUR_MS, "A", DataKind::Coverage).encode().unwrap(),
            key(now.0 - 48 * HOUR_MS, "A", DataKind::Coverage).encode().unwrap(),
        ];
        let c = classify(&keys, now, now, Duration::from_secs(24 * 3600));
        assert_eq!(c.current.len(), 1);
        assert_eq!(c.recent_sessions(), vec![SessionId(now.0 - HOUR_MS)]);
        assert_eq!(c.old_sessions(), vec![SessionId(now.0 - 48 * HOUR_MS)]);
    }

    #[test]
    fn megabyte_rounding() {
        assert_eq!(SizeReport::megabytes(0), 0.0);
        assert_eq!(SizeReport::megabytes(1024 * 1024), 1.0);
        assert_eq!(SizeReport::megabytes(1_572_864), 1.5);
        assert_eq!(SizeReport::megabytes(10_000), 0.01);
    }

    async fn seeded(now: SessionId) -> (Arc<CacheStorage>, SessionManager) {
        let storage = Arc::new(CacheStorage::memory());
        for k in [
            key(now.0, "BRCA1", DataKind::RawVariants),
            key(now.0, "BRCA1", DataKind::DangerSummary),
            key(now.0 - HOUR_MS, "BRCA1", DataKind::RawVariants),
            key(now.0 - 30 * HOUR_MS, "TP53", DataKind::RawVariants),
        ] {
            storage
                .put(&k, Payload::Compressed("0123456789".into()))
                .await
                .unwrap();
        }
        let mgr = SessionManager::new(storage.clone(), now, Duration::from_secs(24 * 3600), false);
        (storage, mgr)
    }

    #[tokio::test]
    async fn size_report_by_class() {
        let now = SessionId(1_000 * HOUR_MS);
        let (_, mgr) = seeded(now).await;
        let report = mgr.size_report_at(now).await.unwrap();
        assert_eq!(report.current_bytes, 20);
        assert_eq!(report.recent_bytes, 10);
        assert_eq!(report.old_bytes, 10);
        assert_eq!(report.old_sessions.len(), 1);
        assert_eq!(report.old_sessions[0].session_id, SessionId(now.0 - 30 * HOUR_MS));
    }

    #[tokio::test]
    async fn evict_older_than_leaves_other_sessions() {
        let now = SessionId(1_000 * HOUR_MS);
        let (storage, mgr) = seeded(now).await;
        let reports = mgr
            .evict_older_than_at(Duration::from_secs(24 * 3600), now)
            .await
            .unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].removed, 1);
        assert!(reports[0].is_clean());
        let left = storage.list_all_keys().await.unwrap();
        assert_eq!(left.len(), 3);
        assert!(left
            .iter()
            .filter_map(|k| CacheKey::decode(k))
            .all(|k| k.session_id != SessionId(now.0 - 30 * HOUR_MS)));
    }

    #[tokio::test]
    async fn eviction_uses_stored_key_strings() {
        let flat = Arc::new(FlatStore::memory());
        let raw = [
            "gene.iobio^5^mother^s1^TP53^T1^geneCoverage^vep",
            "gene.iobio^5^proband^s1^BRCA1^T1^vcfData",
            "gene.iobio^05^proband^s1^BRCA2^T1^vcfData^vep",
            "gene.iobio^5^proband^s1^EGFR^T1^vcfData^vep",
            "gene.iobio^6^proband^s1^EGFR^T1^vcfData^vep",
        ];
        for k in raw {
            flat.set_item(k, "0123456789").unwrap();
        }
        let storage = Arc::new(CacheStorage::with_backend(flat, 1024));
        assert_eq!(storage.list_keys_for_session(SessionId(5)).await.unwrap().len(), 4);

        let mgr = SessionManager::new(storage.clone(), SessionId(5), Duration::from_secs(3600), false);
        let sizes = mgr.size_report_at(SessionId(5)).await.unwrap();
        assert_eq!(sizes.current_bytes, 40);

        let report = evict_session(&storage, SessionId(5)).await.unwrap();
        assert_eq!(report.removed, 4);
        assert!(report.is_clean());
        assert_eq!(storage.list_all_keys().await.unwrap(), vec![raw[4].to_string()]);
    }

    #[tokio::test]
    async fn keep_cache_blocks_clear_current() {
        let now = SessionId(1_000 * HOUR_MS);
        let (storage, _) = seeded(now).await;
        let keep = SessionManager::new(storage.clone(), now, Duration::from_secs(3600), true);
        assert!(keep.clear_current().await.unwrap().is_none());
        assert_eq!(storage.list_keys_for_session(now).await.unwrap().len(), 2);

        let clear = SessionManager::new(storage.clone(), now, Duration::from_secs(3600), false);
        assert_eq!(clear.clear_current().await.unwrap().unwrap().removed, 2);
        assert!(storage.list_keys_for_session(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn contents_filters_and_totals() {
        let now = SessionId(1_000 * HOUR_MS);
        let (_, mgr) = seeded(now).await;

        let all_current = mgr.contents(&KeyFilter::default()).await.unwrap();
        assert_eq!(all_current.entries.len(), 2);
        let expected: u64 = all_current.entries.iter().map(|e| e.bytes).sum();
        assert_eq!(all_current.total_bytes, expected);
        assert_eq!(all_current.by_kind.len(), 2);

        let vcf_everywhere = mgr
            .contents(&KeyFilter {
                data_kind: Some(DataKind::RawVariants),
                all_sessions: true,
                ..KeyFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(vcf_everywhere.entries.len(), 3);

        let tp53 = mgr
            .contents(&KeyFilter {
                unit_name: Some("TP53".into()),
                ..KeyFilter::default()
            })
            .await
            .unwrap();
        assert!(tp53.entries.is_empty());
    }
}
