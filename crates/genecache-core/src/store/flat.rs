//! Flat string key/value store.
//!
//! Behaves like a browser's local storage: one synchronous map shared with
//! unrelated application data, optionally persisted to a JSON file. Writes go
//! to a temp file next to the target and are renamed into place.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::error::{BackendError, BackendResult};
use super::CacheBackend;
use crate::key::{CacheKey, DataKind};

pub struct FlatStore {
    items: Mutex<BTreeMap<String, String>>,
    path: Option<PathBuf>,
}

impl FlatStore {
    /// Store held only in memory.
    pub fn memory() -> Self {
        Self {
            items: Mutex::new(BTreeMap::new()),
            path: None,
        }
    }

    /// Open a file-backed store; a missing file starts empty.
    pub fn open(path: &Path) -> BackendResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.is_dir() {
                return Err(BackendError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("directory {} does not exist", parent.display()),
                )));
            }
        }
        let items = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            if text.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&text)?
            }
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            items: Mutex::new(items),
            path: Some(path.to_path_buf()),
        })
    }

    /// Store an arbitrary item. Used by the host application for non-cache data.
    pub fn set_item(&self, key: &str, value: &str) -> BackendResult<()> {
        self.mutate(|items| {
            items.insert(key.to_string(), value.to_string());
        })
    }

    pub fn get_item(&self, key: &str) -> BackendResult<Option<String>> {
        let items = self.items.lock().map_err(|_| BackendError::Poisoned)?;
        Ok(items.get(key).cloned())
    }

    pub fn remove_item(&self, key: &str) -> BackendResult<()> {
        self.mutate(|items| {
            items.remove(key);
        })
    }

    /// Every key in the map, cache keys and foreign keys alike.
    pub fn keys(&self) -> BackendResult<Vec<String>> {
        let items = self.items.lock().map_err(|_| BackendError::Poisoned)?;
        Ok(items.keys().cloned().collect())
    }

    fn mutate<F>(&self, f: F) -> BackendResult<()>
    where
        F: FnOnce(&mut BTreeMap<String, String>),
    {
        let mut items = self.items.lock().map_err(|_| BackendError::Poisoned)?;
        match &self.path {
            None => {
                f(&mut items);
                Ok(())
            }
            Some(path) => {
                // Persist a modified copy first so a failed write leaves memory untouched.
                let mut next = items.clone();
                f(&mut next);
                persist(path, &next)?;
                *items = next;
                Ok(())
            }
        }
    }
}

fn persist(path: &Path, items: &BTreeMap<String, String>) -> BackendResult<()> {
    let json = serde_json::to_vec(items)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[async_trait]
impl CacheBackend for FlatStore {
    fn name(&self) -> &'static str {
        "flat"
    }

    async fn set(&self, _key: &CacheKey, encoded: &str, payload: String) -> BackendResult<()> {
        self.mutate(|items| {
            items.insert(encoded.to_string(), payload);
        })
    }

    async fn get(&self, encoded: &str) -> BackendResult<Option<String>> {
        self.get_item(encoded)
    }

    async fn remove(&self, _data_kind: DataKind, encoded: &str) -> BackendResult<()> {
        self.remove_item(encoded)
    }

    async fn list_all_keys(&self) -> BackendResult<Vec<String>> {
        self.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{KeyFields, SessionId};

    fn key() -> CacheKey {
        CacheKey::new(
            SessionId(10),
            KeyFields::new("proband", "s", "BRCA2", "T2", DataKind::Coverage, None),
        )
    }

    #[tokio::test]
    async fn shares_keyspace_with_foreign_items() {
        let store = FlatStore::memory();
        store.set_item("theme", "dark").unwrap();
        let k = key();
        let encoded = k.encode().unwrap();
        store.set(&k, &encoded, "payload".into()).await.unwrap();

        let mut keys = store.list_all_keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec![encoded.clone(), "theme".to_string()]);

        store.remove(DataKind::Coverage, &encoded).await.unwrap();
        assert_eq!(store.get(&encoded).await.unwrap(), None);
        assert_eq!(store.get_item("theme").unwrap().as_deref(), Some("dark"));
    }

    #[tokio::test]
    async fn file_backed_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let k = key();
        let encoded = k.encode().unwrap();
        {
            let store = FlatStore::open(&path).unwrap();
            store.set(&k, &encoded, "abc".into()).await.unwrap();
        }
        let store = FlatStore::open(&path).unwrap();
        assert_eq!(store.get(&encoded).await.unwrap().as_deref(), Some("abc"));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn missing_parent_directory_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope").join("cache.json");
        assert!(FlatStore::open(&path).is_err());
    }

    #[test]
    fn corrupt_file_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(FlatStore::open(&path), Err(BackendError::Json(_))));
    }
}
