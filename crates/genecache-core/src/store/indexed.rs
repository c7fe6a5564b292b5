//! SQLite-backed store partitioned by data kind.
//!
//! Each entry records its data kind and unit alongside the payload so that
//! per-kind removal and per-unit lookups hit an index. rusqlite is blocking;
//! every call runs on the blocking pool.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::error::{BackendError, BackendResult};
use super::CacheBackend;
use crate::key::{CacheKey, DataKind};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entries (
    cache_key  TEXT PRIMARY KEY NOT NULL,
    data_kind  TEXT NOT NULL,
    unit_name  TEXT NOT NULL,
    payload    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_entries_kind ON entries(data_kind);
CREATE INDEX IF NOT EXISTS idx_entries_unit ON entries(unit_name);
"#;

#[derive(Clone)]
pub struct IndexedStore {
    conn: Arc<Mutex<Connection>>,
}

impl IndexedStore {
    /// Open a file-backed store.
    pub fn open(path: &Path) -> BackendResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn memory() -> BackendResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_connection(conn: &Connection) -> BackendResult<()> {
        // WAL mode for file-backed DBs (no-op for in-memory)
        let _ = conn.execute_batch("PRAGMA journal_mode = WAL");
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    async fn with_conn<T, F>(&self, f: F) -> BackendResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> BackendResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| BackendError::Poisoned)?;
            f(&guard)
        })
        .await?
    }
}

#[async_trait]
impl CacheBackend for IndexedStore {
    fn name(&self) -> &'static str {
        "indexed"
    }

    async fn set(&self, key: &CacheKey, encoded: &str, payload: String) -> BackendResult<()> {
        let encoded = encoded.to_string();
        let kind = key.data_kind().as_tag();
        let unit = key.unit_name().to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO entries (cache_key, data_kind, unit_name, payload) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(cache_key) DO UPDATE SET payload = excluded.payload",
                params![encoded, kind, unit, payload],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, encoded: &str) -> BackendResult<Option<String>> {
        let encoded = encoded.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT payload FROM entries WHERE cache_key = ?1",
                    params![encoded],
                    |row| row.get::<_, String>(0),
                )
                .optional()?)
        })
        .await
    }

    async fn remove(&self, data_kind: DataKind, encoded: &str) -> BackendResult<()> {
        let encoded = encoded.to_string();
        let kind = data_kind.as_tag();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM entries WHERE data_kind = ?1 AND cache_key = ?2",
                params![kind, encoded],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_all_keys(&self) -> BackendResult<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT cache_key FROM entries ORDER BY cache_key")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let out = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(out)
        })
        .await
    }

    async fn list_keys_for_unit(&self, unit_name: &str) -> BackendResult<Vec<String>> {
        let unit = unit_name.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare("SELECT cache_key FROM entries WHERE unit_name = ?1 ORDER BY cache_key")?;
            let rows = stmt.query_map(params![unit], |row| row.get::<_, String>(0))?;
            let out = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(out)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{KeyFields, SessionId};

    fn key(unit: &str, kind: DataKind) -> CacheKey {
        CacheKey::new(
            SessionId(77),
            KeyFields::new("proband", "s", unit, "T", kind, Some("vep".into())),
        )
    }

    #[tokio::test]
    async fn set_get_overwrite_remove() {
        let store = IndexedStore::memory().unwrap();
        let k = key("BRCA1", DataKind::RawVariants);
        let enc = k.encode().unwrap();

        store.set(&k, &enc, "one".into()).await.unwrap();
        store.set(&k, &enc, "two".into()).await.unwrap();
        assert_eq!(store.get(&enc).await.unwrap().as_deref(), Some("two"));
        assert_eq!(store.list_all_keys().await.unwrap(), vec![enc.clone()]);

        // wrong partition: nothing removed
        store.remove(DataKind::Coverage, &enc).await.unwrap();
        assert!(store.get(&enc).await.unwrap().is_some());

        store.remove(DataKind::RawVariants, &enc).await.unwrap();
        assert!(store.get(&enc).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unit_index_lookup() {
        let store = IndexedStore::memory().unwrap();
        for (unit, kind) in [
            ("BRCA1", DataKind::RawVariants),
            ("BRCA1", DataKind::DangerSummary),
            ("TP53", DataKind::RawVariants),
        ] {
            let k = key(unit, kind);
            store
                .set(&k, &k.encode().unwrap(), "x".into())
                .await
                .unwrap();
        }
        let brca1 = store.list_keys_for_unit("BRCA1").await.unwrap();
        assert_eq!(
            brca1,
            vec![
                key("BRCA1", DataKind::DangerSummary).encode().unwrap(),
                key("BRCA1", DataKind::RawVariants).encode().unwrap(),
            ]
        );
        assert!(store.list_keys_for_unit("EGFR").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_backed_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.sqlite");
        let k = key("TP53", DataKind::DangerSummary);
        let enc = k.encode().unwrap();
        {
            let store = IndexedStore::open(&path).unwrap();
            store.set(&k, &enc, "payload".into()).await.unwrap();
        }
        let store = IndexedStore::open(&path).unwrap();
        assert_eq!(store.get(&enc).await.unwrap().as_deref(), Some("payload"));
    }
}
