//! Per-conversation state: an open field map persisted through [`Storage`], plus the
//! per-key locks that serialize turns on one conversation.

use crate::storage::{Storage, StorageError, WriteCondition};
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

const CONVERSATION_PREFIX: &str = "conversation/";

/// Device flag toggled by the lights actions.
pub const LIGHTS_ON_FIELD: &str = "lightsOn";
/// Id of the skill currently handling this conversation, if any.
pub const ACTIVE_SKILL_FIELD: &str = "skillbot";

/// Mutable fields of one conversation. The field set is open; typed accessors cover
/// the fields the built-in actions use.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationRecord {
    key: String,
    fields: Map<String, Value>,
    etag: Option<u64>,
}

impl ConversationRecord {
    /// A record that has never been saved.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            fields: Map::new(),
            etag: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn etag(&self) -> Option<u64> {
        self.etag
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    pub fn get_bool(&self, field: &str) -> Option<bool> {
        self.fields.get(field).and_then(Value::as_bool)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    pub fn get_i64(&self, field: &str) -> Option<i64> {
        self.fields.get(field).and_then(Value::as_i64)
    }

    pub fn lights_on(&self) -> bool {
        self.get_bool(LIGHTS_ON_FIELD).unwrap_or(false)
    }

    pub fn set_lights_on(&mut self, on: bool) {
        self.set(LIGHTS_ON_FIELD, on);
    }

    pub fn active_skill(&self) -> Option<&str> {
        self.get_str(ACTIVE_SKILL_FIELD).filter(|s| !s.is_empty())
    }

    pub fn set_active_skill(&mut self, skill_id: Option<&str>) {
        match skill_id {
            Some(id) => self.set(ACTIVE_SKILL_FIELD, id),
            None => {
                self.remove(ACTIVE_SKILL_FIELD);
            }
        }
    }

    /// JSON snapshot of the fields, as handed to the planner.
    pub fn snapshot(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

/// Loads and saves [`ConversationRecord`]s. Saves are etag-checked, so a save that
/// races another writer fails instead of losing its update.
#[derive(Clone)]
pub struct ConversationStateStore {
    storage: Arc<dyn Storage>,
}

impl ConversationStateStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    fn storage_key(conversation_key: &str) -> String {
        format!("{}{}", CONVERSATION_PREFIX, conversation_key)
    }

    /// Current record, or a fresh one on the first turn of a conversation.
    pub async fn load(&self, conversation_key: &str) -> Result<ConversationRecord, StorageError> {
        let item = self.storage.read(&Self::storage_key(conversation_key)).await?;
        Ok(match item {
            Some(item) => ConversationRecord {
                key: conversation_key.to_string(),
                fields: match item.value {
                    Value::Object(map) => map,
                    _ => Map::new(),
                },
                etag: Some(item.etag),
            },
            None => ConversationRecord::new(conversation_key),
        })
    }

    pub async fn save(&self, record: &mut ConversationRecord) -> Result<(), StorageError> {
        let condition = match record.etag {
            Some(etag) => WriteCondition::Etag(etag),
            None => WriteCondition::Absent,
        };
        let etag = self
            .storage
            .write(
                &Self::storage_key(&record.key),
                Value::Object(record.fields.clone()),
                condition,
            )
            .await?;
        record.etag = Some(etag);
        Ok(())
    }

    pub fn is_durable(&self) -> bool {
        self.storage.is_durable()
    }
}

/// One async mutex per conversation key. Turns on different keys never contend.
#[derive(Default)]
pub struct ConversationLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Held for the duration of a turn. Dropping it releases the key and prunes the
/// lock entry when nobody else is waiting on it.
pub struct ConversationGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    key: String,
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, conversation_key: &str) -> ConversationGuard<'_> {
        let mutex = self
            .locks
            .entry(conversation_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        ConversationGuard {
            guard: Some(guard),
            key: conversation_key.to_string(),
            locks: &self.locks,
        }
    }

    /// Takes the key only if no turn holds it right now.
    pub fn try_lock(&self, conversation_key: &str) -> Option<ConversationGuard<'_>> {
        let mutex = self
            .locks
            .entry(conversation_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        match Arc::clone(&mutex).try_lock_owned() {
            Ok(guard) => Some(ConversationGuard {
                guard: Some(guard),
                key: conversation_key.to_string(),
                locks: &self.locks,
            }),
            Err(_) => {
                drop(mutex);
                self.locks
                    .remove_if(conversation_key, |_, m| Arc::strong_count(m) == 1);
                None
            }
        }
    }

    /// Number of keys with a live lock entry.
    pub fn active_keys(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for ConversationGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map's own Arc left: no holder, no waiter.
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
