//! Export and import of a session's cache as a portable bundle.
//!
//! A bundle is a JSON array of `{ "key": ..., "payload": ... }` entries.
//! Import replaces the current session: it is cleared first, then every entry
//! is re-keyed to the active session and written back.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use crate::compress::{self, Payload};
use crate::error::{CacheError, CacheResult};
use crate::key::{decode_any, CacheKey, DataKind, SessionId};
use crate::session::evict_session;
use crate::store::CacheStorage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub key: String,
    #[serde(alias = "cache")]
    pub payload: Payload,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyForm {
    /// Keys keep their session id.
    #[default]
    Full,
    /// Keys without session id.
    Portable,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportOptions {
    pub skip_kinds: Vec<DataKind>,
    /// When non-empty, only these kinds are exported.
    pub only_kinds: Vec<DataKind>,
    pub unit_name: Option<String>,
    pub key_form: KeyForm,
    /// Decode payloads instead of exporting the stored text.
    pub decompress: bool,
}

impl ExportOptions {
    fn includes(&self, key: &CacheKey) -> bool {
        let kind = key.data_kind();
        !self.skip_kinds.contains(&kind)
            && (self.only_kinds.is_empty() || self.only_kinds.contains(&kind))
            && self.unit_name.as_deref().map_or(true, |u| key.unit_name() == u)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportOptions {
    /// Entries of these kinds are not written.
    pub skip_kinds: Vec<DataKind>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub session_id: SessionId,
    pub cleared: usize,
    pub written: usize,
    pub skipped: usize,
    pub restored_units: Vec<String>,
}

/// Receives derived state rebuilt from imported summaries.
#[async_trait]
pub trait SummaryObserver: Send + Sync {
    /// Units that now have a cached summary.
    async fn units_restored(&self, units: &[String]) -> anyhow::Result<()>;

    async fn summary_restored(&self, unit_name: &str, summary: Value) -> anyhow::Result<()>;
}

/// Current-session entries, stored text intact unless `options.decompress`.
pub async fn export(
    storage: &CacheStorage,
    session: SessionId,
    options: &ExportOptions,
) -> CacheResult<Vec<SnapshotEntry>> {
    let mut entries = Vec::new();
    for stored in storage.list_keys_for_session(session).await? {
        if !options.includes(&stored.key) {
            continue;
        }
        let Some(payload) = storage.get_encoded(&stored.raw, options.decompress).await? else {
            continue;
        };
        let key = match options.key_form {
            KeyForm::Full => stored.raw,
            KeyForm::Portable => stored.portable().to_string(),
        };
        entries.push(SnapshotEntry { key, payload });
    }
    tracing::info!(session = %session, entries = entries.len(), "cache exported");
    Ok(entries)
}

/// Replace the current session with `bundle`.
///
/// `already_compressed` says whether string payloads are stored text (written
/// as is) or plain values to compress. Every entry is attempted; failures are
/// reported once at the end as [`CacheError::ImportFailed`].
pub async fn import(
    storage: &CacheStorage,
    session: SessionId,
    bundle: Vec<SnapshotEntry>,
    already_compressed: bool,
    options: &ImportOptions,
    observer: Option<&dyn SummaryObserver>,
) -> CacheResult<ImportReport> {
    let cleared = evict_session(storage, session).await?;
    let total = bundle.len();
    let mut report = ImportReport {
        session_id: session,
        cleared: cleared.removed,
        ..ImportReport::default()
    };
    let mut failures: Vec<String> = cleared
        .failures
        .into_iter()
        .map(|(k, e)| format!("{k}: {e}"))
        .collect();
    let mut summaries: Vec<(String, Payload)> = Vec::new();

    for entry in bundle {
        let Some(key) = decode_any(&entry.key, session) else {
            failures.push(format!("{}: not a cache key", entry.key));
            continue;
        };
        let key = key.with_session(session);
        if options.skip_kinds.contains(&key.data_kind()) {
            report.skipped += 1;
            continue;
        }
        let payload = match (already_compressed, entry.payload) {
            (false, Payload::Compressed(text)) => Payload::Decoded(Value::String(text)),
            (_, payload) => payload,
        };
        if key.data_kind() == DataKind::DangerSummary {
            summaries.push((key.unit_name().to_string(), payload.clone()));
        }
        match storage.put(&key, payload).await {
            Ok(_) => report.written += 1,
            Err(e) => failures.push(format!("{}: {e}", entry.key)),
        }
    }

    let units: BTreeSet<String> = summaries.iter().map(|(u, _)| u.clone()).collect();
    report.restored_units = units.into_iter().collect();

    if let Some(observer) = observer {
        if let Err(e) = observer.units_restored(&report.restored_units).await {
            failures.push(format!("restoring units: {e}"));
        }
        for (unit, payload) in summaries {
            let value = match payload {
                Payload::Decoded(v) => v,
                Payload::Compressed(text) => match compress::decompress(&text, true) {
                    Ok(Payload::Decoded(v)) => v,
                    Ok(Payload::Compressed(_)) => continue,
                    Err(e) => {
                        failures.push(format!("summary for {unit}: {e}"));
                        continue;
                    }
                },
            };
            if let Err(e) = observer.summary_restored(&unit, value).await {
                failures.push(format!("summary for {unit}: {e}"));
            }
        }
    }

    tracing::info!(
        session = %session,
        written = report.written,
        skipped = report.skipped,
        failed = failures.len(),
        "cache imported"
    );
    if let Some(first) = failures.first() {
        return Err(CacheError::ImportFailed {
            failed: failures.len(),
            total,
            first: first.clone(),
        });
    }
    Ok(report)
}
