//! Key-value storage contract shared by conversation state and skill conversation
//! mappings, with an in-memory (DashMap) and a durable (Sled) backend.
//!
//! Every write bumps a per-key etag. Writers may pass a [`WriteCondition`] so a
//! read-modify-write cycle fails instead of silently overwriting a concurrent update.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

const DEFAULT_SLED_PATH: &str = "./data/skillrelay";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sled: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("etag mismatch for key {key}")]
    EtagMismatch { key: String },
}

/// A stored JSON value and its revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreItem {
    pub value: serde_json::Value,
    pub etag: u64,
}

/// Precondition for a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCondition {
    /// Last writer wins.
    Any,
    /// Key must not exist yet.
    Absent,
    /// Current etag must equal the given one.
    Etag(u64),
}

impl WriteCondition {
    fn admits(&self, current: Option<u64>) -> bool {
        match (self, current) {
            (WriteCondition::Any, _) => true,
            (WriteCondition::Absent, None) => true,
            (WriteCondition::Absent, Some(_)) => false,
            (WriteCondition::Etag(expected), Some(actual)) => *expected == actual,
            (WriteCondition::Etag(_), None) => false,
        }
    }
}

#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<StoreItem>, StorageError>;

    /// Writes `value` under `key` if `condition` holds; returns the new etag.
    async fn write(
        &self,
        key: &str,
        value: serde_json::Value,
        condition: WriteCondition,
    ) -> Result<u64, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// All entries whose key starts with `prefix`, in key order.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, StoreItem)>, StorageError>;

    /// Whether data survives a process restart.
    fn is_durable(&self) -> bool;
}

/// Process-local storage. Lost on restart.
#[derive(Default)]
pub struct MemoryStorage {
    items: DashMap<String, StoreItem>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait::async_trait]
impl Storage for MemoryStorage {
    async fn read(&self, key: &str) -> Result<Option<StoreItem>, StorageError> {
        Ok(self.items.get(key).map(|item| item.clone()))
    }

    async fn write(
        &self,
        key: &str,
        value: serde_json::Value,
        condition: WriteCondition,
    ) -> Result<u64, StorageError> {
        // The entry guard holds the shard lock, so check and insert are atomic per key.
        match self.items.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get().etag;
                if !condition.admits(Some(current)) {
                    return Err(StorageError::EtagMismatch { key: key.to_string() });
                }
                let etag = current + 1;
                occupied.insert(StoreItem { value, etag });
                Ok(etag)
            }
            Entry::Vacant(vacant) => {
                if !condition.admits(None) {
                    return Err(StorageError::EtagMismatch { key: key.to_string() });
                }
                vacant.insert(StoreItem { value, etag: 1 });
                Ok(1)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.items.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, StoreItem)>, StorageError> {
        let mut out: Vec<(String, StoreItem)> = self
            .items
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn is_durable(&self) -> bool {
        false
    }
}

/// Sled-backed storage on the host filesystem. Durable across restarts.
pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    /// Open at the given path, or `./data/skillrelay` when none is given.
    pub fn open(path: Option<impl AsRef<Path>>) -> Result<Self, StorageError> {
        let p = path
            .map(|x| x.as_ref().to_path_buf())
            .unwrap_or_else(|| Path::new(DEFAULT_SLED_PATH).to_path_buf());
        let db = sled::open(p)?;
        Ok(Self { db })
    }

    fn decode(bytes: &[u8]) -> Result<StoreItem, StorageError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[async_trait::async_trait]
impl Storage for SledStorage {
    async fn read(&self, key: &str) -> Result<Option<StoreItem>, StorageError> {
        match self.db.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn write(
        &self,
        key: &str,
        value: serde_json::Value,
        condition: WriteCondition,
    ) -> Result<u64, StorageError> {
        loop {
            let current = self.db.get(key.as_bytes())?;
            let current_etag = match current.as_ref() {
                Some(bytes) => Some(Self::decode(bytes)?.etag),
                None => None,
            };
            if !condition.admits(current_etag) {
                return Err(StorageError::EtagMismatch { key: key.to_string() });
            }
            let etag = current_etag.map(|e| e + 1).unwrap_or(1);
            let next = serde_json::to_vec(&StoreItem {
                value: value.clone(),
                etag,
            })?;
            match self
                .db
                .compare_and_swap(key.as_bytes(), current.as_ref(), Some(next))?
            {
                Ok(()) => return Ok(etag),
                // Lost a race with another writer; re-evaluate the condition.
                Err(_) => continue,
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.db.remove(key.as_bytes())?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, StoreItem)>, StorageError> {
        let mut out = Vec::new();
        for entry in self.db.scan_prefix(prefix.as_bytes()) {
            let (k, v) = entry?;
            if let Ok(key) = String::from_utf8(k.to_vec()) {
                out.push((key, Self::decode(&v)?));
            }
        }
        Ok(out)
    }

    fn is_durable(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn exercise_conditions(storage: &dyn Storage) {
        let e1 = storage
            .write("k", json!({"n": 1}), WriteCondition::Absent)
            .await
            .unwrap();
        assert_eq!(e1, 1);
        assert!(matches!(
            storage.write("k", json!({"n": 2}), WriteCondition::Absent).await,
            Err(StorageError::EtagMismatch { .. })
        ));
        let e2 = storage
            .write("k", json!({"n": 2}), WriteCondition::Etag(e1))
            .await
            .unwrap();
        assert_eq!(e2, 2);
        assert!(matches!(
            storage.write("k", json!({"n": 3}), WriteCondition::Etag(e1)).await,
            Err(StorageError::EtagMismatch { .. })
        ));
        let item = storage.read("k").await.unwrap().unwrap();
        assert_eq!(item.value["n"], 2);
        storage.delete("k").await.unwrap();
        assert!(storage.read("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_storage_honours_write_conditions() {
        let storage = MemoryStorage::new();
        exercise_conditions(&storage).await;
        assert!(!storage.is_durable());
    }

    #[tokio::test]
    async fn sled_storage_honours_write_conditions() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SledStorage::open(Some(dir.path())).unwrap();
        exercise_conditions(&storage).await;
        assert!(storage.is_durable());
    }

    #[tokio::test]
    async fn sled_storage_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = SledStorage::open(Some(dir.path())).unwrap();
            storage
                .write("conversation/a", json!({"lightsOn": true}), WriteCondition::Any)
                .await
                .unwrap();
            storage.db.flush().unwrap();
        }
        let storage = SledStorage::open(Some(dir.path())).unwrap();
        let item = storage.read("conversation/a").await.unwrap().unwrap();
        assert_eq!(item.value["lightsOn"], true);
    }

    #[tokio::test]
    async fn scan_prefix_filters_and_orders() {
        let storage = MemoryStorage::new();
        for key in ["b/2", "a/1", "b/1"] {
            storage.write(key, json!(key), WriteCondition::Any).await.unwrap();
        }
        let keys: Vec<String> = storage
            .scan_prefix("b/")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, ["b/1", "b/2"]);
    }
}
