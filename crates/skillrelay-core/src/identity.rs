//! Skill conversation identity factory.
//!
//! Issues opaque skill conversation ids that stand in for a local conversation when a
//! turn is forwarded to a skill, and resolves them back when the skill replies. Ids are
//! random UUIDv4 values and act as bearer tokens for reply routing.
//!
//! Policy: one live mapping per (conversation, skill) pair. Delegating to the same skill
//! again from the same conversation reuses that mapping. A mapping expires once it has
//! gone unused for `ttl`; every reuse and every resolved reply counts as use. The total
//! number of mappings is capped at `max_mappings`; inserting at the cap purges expired
//! mappings and then evicts the least recently used ones.

use crate::activity::ConversationReference;
use crate::state::ConversationLocks;
use crate::storage::{Storage, StorageError, WriteCondition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};

const MAPPING_PREFIX: &str = "skillconv/id/";
const PAIR_PREFIX: &str = "skillconv/pair/";

pub const DEFAULT_MAPPING_TTL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_MAX_MAPPINGS: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillConversationMapping {
    pub skill_conversation_id: String,
    pub conversation_reference: ConversationReference,
    pub skill_id: String,
    pub created_at: DateTime<Utc>,
    /// Refreshed on reuse and on reply routing. Absent in records written before it
    /// existed; those fall back to `created_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl SkillConversationMapping {
    /// Key of the local conversation this mapping points back to.
    pub fn conversation_key(&self) -> String {
        self.conversation_reference.conversation_key()
    }

    pub fn last_used(&self) -> DateTime<Utc> {
        self.last_used_at.unwrap_or(self.created_at)
    }

    fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        (now - self.last_used())
            .to_std()
            .map(|idle| idle >= ttl)
            .unwrap_or(false)
    }
}

pub struct ConversationIdFactory {
    storage: Arc<dyn Storage>,
    ttl: Duration,
    max_mappings: usize,
    // Get-or-create is serialized per (conversation, skill) pair only.
    pair_locks: ConversationLocks,
    purge_lock: Mutex<()>,
    // Approximate number of stored mappings; recounted on every purge.
    stored: OnceCell<AtomicUsize>,
}

impl ConversationIdFactory {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self::with_limits(storage, DEFAULT_MAPPING_TTL, DEFAULT_MAX_MAPPINGS)
    }

    pub fn with_limits(storage: Arc<dyn Storage>, ttl: Duration, max_mappings: usize) -> Self {
        Self {
            storage,
            ttl,
            max_mappings: max_mappings.max(1),
            pair_locks: ConversationLocks::new(),
            purge_lock: Mutex::new(()),
            stored: OnceCell::new(),
        }
    }

    /// Whether mappings survive a restart; a property of the backing storage.
    pub fn is_durable(&self) -> bool {
        self.storage.is_durable()
    }

    fn mapping_key(id: &str) -> String {
        format!("{}{}", MAPPING_PREFIX, id)
    }

    fn pair_key(conversation_key: &str, skill_id: &str) -> String {
        format!("{}{}|{}", PAIR_PREFIX, conversation_key, skill_id)
    }

    /// Returns the live skill conversation id for (`reference`, `skill_id`), minting a
    /// new one if there is none.
    pub async fn create_skill_conversation_id(
        &self,
        reference: &ConversationReference,
        skill_id: &str,
    ) -> Result<String, StorageError> {
        let pair_key = Self::pair_key(&reference.conversation_key(), skill_id);
        let _pair = self.pair_locks.lock(&pair_key).await;
        let now = Utc::now();

        if let Some(existing) = self.storage.read(&pair_key).await? {
            if let Some(id) = existing.value.as_str() {
                if let Some((mapping, etag)) = self.read_entry(id).await? {
                    if !mapping.is_expired(now, self.ttl) {
                        self.touch(mapping, etag, now).await?;
                        tracing::debug!(skill = %skill_id, id = %id, "reusing skill conversation id");
                        return Ok(id.to_string());
                    }
                    self.remove(&mapping).await?;
                }
            }
        }

        let stored = self.stored_count().await?;
        if stored.load(Ordering::Relaxed) >= self.max_mappings {
            self.make_room(now).await?;
        }

        let id = uuid::Uuid::new_v4().to_string();
        let mapping = SkillConversationMapping {
            skill_conversation_id: id.clone(),
            conversation_reference: reference.clone(),
            skill_id: skill_id.to_string(),
            created_at: now,
            last_used_at: Some(now),
        };
        self.storage
            .write(
                &Self::mapping_key(&id),
                serde_json::to_value(&mapping)?,
                WriteCondition::Absent,
            )
            .await?;
        stored.fetch_add(1, Ordering::Relaxed);
        self.storage
            .write(&pair_key, serde_json::Value::String(id.clone()), WriteCondition::Any)
            .await?;
        tracing::info!(
            skill = %skill_id,
            conversation = %reference.conversation_key(),
            "issued skill conversation id"
        );
        Ok(id)
    }

    /// Resolves a skill conversation id and marks it used. Unknown and expired ids both
    /// yield `None`.
    pub async fn get_conversation_reference(
        &self,
        skill_conversation_id: &str,
    ) -> Result<Option<SkillConversationMapping>, StorageError> {
        let Some((mapping, etag)) = self.read_entry(skill_conversation_id).await? else {
            return Ok(None);
        };
        let now = Utc::now();
        if mapping.is_expired(now, self.ttl) {
            self.remove(&mapping).await?;
            return Ok(None);
        }
        Ok(Some(self.touch(mapping, etag, now).await?))
    }

    /// The live skill conversation id for a pair, without minting one.
    pub async fn live_skill_conversation_id(
        &self,
        conversation_key: &str,
        skill_id: &str,
    ) -> Result<Option<String>, StorageError> {
        let Some(item) = self
            .storage
            .read(&Self::pair_key(conversation_key, skill_id))
            .await?
        else {
            return Ok(None);
        };
        let Some(id) = item.value.as_str() else {
            return Ok(None);
        };
        Ok(self
            .get_conversation_reference(id)
            .await?
            .map(|m| m.skill_conversation_id))
    }

    /// Ends a delegation episode.
    pub async fn delete_conversation_reference(
        &self,
        skill_conversation_id: &str,
    ) -> Result<(), StorageError> {
        if let Some((mapping, _)) = self.read_entry(skill_conversation_id).await? {
            self.remove(&mapping).await?;
        }
        Ok(())
    }

    /// Number of stored mappings, expired ones included until they are purged.
    pub async fn mapping_count(&self) -> Result<usize, StorageError> {
        Ok(self.storage.scan_prefix(MAPPING_PREFIX).await?.len())
    }

    async fn stored_count(&self) -> Result<&AtomicUsize, StorageError> {
        self.stored
            .get_or_try_init(|| async {
                let n = self.storage.scan_prefix(MAPPING_PREFIX).await?.len();
                Ok::<_, StorageError>(AtomicUsize::new(n))
            })
            .await
    }

    async fn read_entry(
        &self,
        id: &str,
    ) -> Result<Option<(SkillConversationMapping, u64)>, StorageError> {
        match self.storage.read(&Self::mapping_key(id)).await? {
            Some(item) => Ok(Some((serde_json::from_value(item.value)?, item.etag))),
            None => Ok(None),
        }
    }

    /// Records use. A concurrent touch or delete wins over this one.
    async fn touch(
        &self,
        mut mapping: SkillConversationMapping,
        etag: u64,
        now: DateTime<Utc>,
    ) -> Result<SkillConversationMapping, StorageError> {
        mapping.last_used_at = Some(now);
        match self
            .storage
            .write(
                &Self::mapping_key(&mapping.skill_conversation_id),
                serde_json::to_value(&mapping)?,
                WriteCondition::Etag(etag),
            )
            .await
        {
            Ok(_) | Err(StorageError::EtagMismatch { .. }) => Ok(mapping),
            Err(e) => Err(e),
        }
    }

    async fn remove(&self, mapping: &SkillConversationMapping) -> Result<(), StorageError> {
        let key = Self::mapping_key(&mapping.skill_conversation_id);
        if self.storage.read(&key).await?.is_some() {
            self.storage.delete(&key).await?;
            if let Some(stored) = self.stored.get() {
                let _ = stored.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                    Some(n.saturating_sub(1))
                });
            }
        }
        let pair_key = Self::pair_key(&mapping.conversation_key(), &mapping.skill_id);
        // The pair index may already point at a newer episode; leave that one alone.
        if let Some(item) = self.storage.read(&pair_key).await? {
            if item.value.as_str() == Some(mapping.skill_conversation_id.as_str()) {
                self.storage.delete(&pair_key).await?;
            }
        }
        Ok(())
    }

    /// Purges expired mappings, then evicts the least recently used until one more fits.
    async fn make_room(&self, now: DateTime<Utc>) -> Result<(), StorageError> {
        let _purging = self.purge_lock.lock().await;
        let mut live = Vec::new();
        for (_, item) in self.storage.scan_prefix(MAPPING_PREFIX).await? {
            let mapping: SkillConversationMapping = match serde_json::from_value(item.value) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable skill conversation mapping");
                    continue;
                }
            };
            if mapping.is_expired(now, self.ttl) {
                self.remove(&mapping).await?;
            } else {
                live.push(mapping);
            }
        }
        let mut remaining = live.len();
        if remaining >= self.max_mappings {
            live.sort_by_key(|m| m.last_used());
            let excess = remaining + 1 - self.max_mappings;
            for mapping in live.iter().take(excess) {
                tracing::info!(
                    id = %mapping.skill_conversation_id,
                    skill = %mapping.skill_id,
                    "evicting least recently used skill conversation mapping"
                );
                self.remove(mapping).await?;
            }
            remaining -= excess;
        }
        if let Some(stored) = self.stored.get() {
            stored.store(remaining, Ordering::Relaxed);
        }
        Ok(())
    }
}
