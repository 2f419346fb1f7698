//! Message cache and outbox over a [`KvStore`].

use std::sync::Arc;

use clanchat_types::{ConversationId, Message, MessagePatch, compare_timestamps, insert_sorted};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::StoreConfig;
use crate::kv::{KvStore, StoreError};

const CACHE_NS: &str = "messages";
const OUTBOX_NS: &str = "outbox";
const CACHE_KEY_PREFIX: &str = "chat_";

/// Persisted form of one conversation's cached messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedConversation {
    #[serde(rename = "chatId")]
    pub conversation_id: ConversationId,
    /// Ascending by timestamp, at most `cache_limit` entries.
    pub messages: Vec<Message>,
    /// Unix millis of the last write.
    pub last_updated: u64,
}

/// A message waiting to be delivered.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    /// `{conversation}_{timestamp}_{local millis}`, unique per enqueue.
    pub outbox_id: String,
    pub message: Message,
    pub retry_count: u32,
    /// Unix millis of the last enqueue or delivery attempt.
    pub last_attempt: u64,
}

/// Partial update of an outbox entry's retry bookkeeping.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutboxPatch {
    pub retry_count: Option<u32>,
    pub last_attempt: Option<u64>,
}

/// Entry counts per keyspace.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StorageInfo {
    pub cache_entries: usize,
    pub outbox_entries: usize,
}

/// Bounded, expiring message cache plus a durable outbox.
///
/// Read-modify-write operations hold a per-key lock, so appends to one
/// conversation never contend with another conversation or the outbox. A
/// key's lock is released when its record is deleted.
pub struct MessageStore {
    kv: Box<dyn KvStore>,
    config: StoreConfig,
    clock: Arc<dyn Clock>,
    locks: DashMap<(&'static str, String), Arc<Mutex<()>>>,
}

impl MessageStore {
    pub fn new(kv: impl KvStore + 'static, config: StoreConfig) -> Self {
        Self::with_clock(kv, config, Arc::new(SystemClock))
    }

    pub fn with_clock(kv: impl KvStore + 'static, config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            kv: Box::new(kv),
            config,
            clock,
            locks: DashMap::new(),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    fn key_lock(&self, namespace: &'static str, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry((namespace, key.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Forget a key's lock unless a writer still holds it.
    fn release_lock(&self, namespace: &'static str, key: &str) {
        self.locks
            .remove_if(&(namespace, key.to_string()), |_, lock| Arc::strong_count(lock) == 1);
    }

    fn release_locks(&self, namespace: &'static str) {
        self.locks
            .retain(|(ns, _), lock| *ns != namespace || Arc::strong_count(lock) > 1);
    }

    fn cache_key(conversation_id: &ConversationId) -> String {
        format!("{CACHE_KEY_PREFIX}{conversation_id}")
    }

    fn is_expired(&self, last_updated: u64) -> bool {
        let age = self.clock.now_millis().saturating_sub(last_updated);
        age > self.config.cache_expiry().as_millis() as u64
    }

    // =========================================================================
    // Message cache
    // =========================================================================

    /// Cached messages for a conversation, oldest first.
    ///
    /// Missing, expired, and unreadable entries all read as empty. An expired
    /// entry is deleted on the way out.
    pub fn get_messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        let key = Self::cache_key(conversation_id);
        match self.read_cached(&key) {
            Ok(Some(cached)) => {
                if self.is_expired(cached.last_updated) {
                    debug!(conversation = %conversation_id, "cache entry expired, evicting");
                    self.delete_logged(CACHE_NS, &key);
                    return Vec::new();
                }
                cached.messages
            }
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(conversation = %conversation_id, "failed to read cached messages: {e}");
                Vec::new()
            }
        }
    }

    /// Replace the cached list, keeping only the newest `cache_limit`.
    pub fn set_messages(&self, conversation_id: &ConversationId, messages: &[Message]) {
        let key = Self::cache_key(conversation_id);
        let lock = self.key_lock(CACHE_NS, &key);
        let _guard = lock.lock();
        self.write_cached(conversation_id, &key, messages.to_vec());
    }

    /// Append unless a message with the same `(timestamp, sender)` is cached.
    pub fn append_message(&self, conversation_id: &ConversationId, message: Message) {
        let key = Self::cache_key(conversation_id);
        let lock = self.key_lock(CACHE_NS, &key);
        let _guard = lock.lock();

        let mut messages = self.get_messages(conversation_id);
        if messages.iter().any(|m| m.same_identity(&message)) {
            return;
        }
        insert_sorted(&mut messages, message);
        self.write_cached(conversation_id, &key, messages);
    }

    /// Patch every cached message with the given timestamp.
    pub fn update_message(&self, conversation_id: &ConversationId, timestamp: &str, patch: &MessagePatch) {
        let key = Self::cache_key(conversation_id);
        let lock = self.key_lock(CACHE_NS, &key);
        let _guard = lock.lock();

        let mut messages = self.get_messages(conversation_id);
        for message in messages.iter_mut().filter(|m| m.timestamp == timestamp) {
            patch.apply(message);
        }
        self.write_cached(conversation_id, &key, messages);
    }

    /// Remove every cached message with the given timestamp.
    pub fn remove_message(&self, conversation_id: &ConversationId, timestamp: &str) {
        let key = Self::cache_key(conversation_id);
        let lock = self.key_lock(CACHE_NS, &key);
        let _guard = lock.lock();

        let mut messages = self.get_messages(conversation_id);
        messages.retain(|m| m.timestamp != timestamp);
        self.write_cached(conversation_id, &key, messages);
    }

    pub fn clear_conversation(&self, conversation_id: &ConversationId) {
        self.delete_logged(CACHE_NS, &Self::cache_key(conversation_id));
    }

    pub fn clear_all_cache(&self) {
        if let Err(e) = self.kv.clear(CACHE_NS) {
            warn!("failed to clear message cache: {e}");
            return;
        }
        self.release_locks(CACHE_NS);
    }

    /// Ids of every conversation with a cache record, expired or not.
    pub fn cached_conversations(&self) -> Vec<ConversationId> {
        match self.kv.keys(CACHE_NS) {
            Ok(keys) => keys
                .into_iter()
                .filter_map(|k| k.strip_prefix(CACHE_KEY_PREFIX).map(ConversationId::from))
                .collect(),
            Err(e) => {
                warn!("failed to list cached conversations: {e}");
                Vec::new()
            }
        }
    }

    /// The raw cache record, expired or not. Nothing is evicted.
    pub fn peek_cached(&self, conversation_id: &ConversationId) -> Option<CachedConversation> {
        match self.read_cached(&Self::cache_key(conversation_id)) {
            Ok(cached) => cached,
            Err(e) => {
                warn!(conversation = %conversation_id, "failed to read cached messages: {e}");
                None
            }
        }
    }

    /// Whether a cache record written at `last_updated` is past expiry.
    pub fn is_cache_expired(&self, cached: &CachedConversation) -> bool {
        self.is_expired(cached.last_updated)
    }

    fn read_cached(&self, key: &str) -> Result<Option<CachedConversation>, StoreError> {
        match self.kv.get(CACHE_NS, key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn write_cached(&self, conversation_id: &ConversationId, key: &str, mut messages: Vec<Message>) {
        let limit = self.config.cache_limit;
        if messages.len() > limit {
            messages.drain(..messages.len() - limit);
        }
        let cached = CachedConversation {
            conversation_id: conversation_id.clone(),
            messages,
            last_updated: self.clock.now_millis(),
        };
        let result = serde_json::to_string(&cached)
            .map_err(StoreError::from)
            .and_then(|raw| self.kv.set(CACHE_NS, key, &raw));
        if let Err(e) = result {
            warn!(conversation = %conversation_id, "failed to cache messages: {e}");
        }
    }

    // =========================================================================
    // Outbox
    // =========================================================================

    /// Queue a message for later delivery. Returns the new outbox id, or
    /// `None` if the write failed.
    pub fn add_outbox_message(&self, message: Message) -> Option<String> {
        let now = self.clock.now_millis();
        let mut stamp = now;
        let outbox_id = loop {
            let candidate = format!("{}_{}_{}", message.conversation_id, message.timestamp, stamp);
            match self.kv.get(OUTBOX_NS, &candidate) {
                Ok(Some(_)) => stamp += 1,
                Ok(None) => break candidate,
                Err(e) => {
                    warn!(conversation = %message.conversation_id, "failed to add outbox message: {e}");
                    return None;
                }
            }
        };

        let entry = OutboxEntry {
            outbox_id: outbox_id.clone(),
            message,
            retry_count: 0,
            last_attempt: now,
        };
        match self.write_outbox(&entry) {
            Ok(()) => Some(outbox_id),
            Err(e) => {
                warn!(conversation = %entry.message.conversation_id, "failed to add outbox message: {e}");
                None
            }
        }
    }

    /// Outbox entries, optionally for one conversation, oldest message first.
    pub fn get_outbox_messages(&self, conversation_id: Option<&ConversationId>) -> Vec<OutboxEntry> {
        let keys = match self.kv.keys(OUTBOX_NS) {
            Ok(keys) => keys,
            Err(e) => {
                warn!("failed to list outbox: {e}");
                return Vec::new();
            }
        };

        let mut entries: Vec<OutboxEntry> = keys
            .iter()
            .filter_map(|key| match self.read_outbox(key) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(outbox_id = %key, "skipping unreadable outbox entry: {e}");
                    None
                }
            })
            .filter(|entry| conversation_id.is_none_or(|id| &entry.message.conversation_id == id))
            .collect();

        entries.sort_by(|a, b| {
            compare_timestamps(&a.message.timestamp, &b.message.timestamp)
                .then_with(|| a.outbox_id.cmp(&b.outbox_id))
        });
        entries
    }

    pub fn update_outbox_message(&self, outbox_id: &str, patch: &OutboxPatch) {
        let lock = self.key_lock(OUTBOX_NS, outbox_id);
        let guard = lock.lock();

        let mut missing = false;
        let result = self.read_outbox(outbox_id).and_then(|entry| {
            let Some(mut entry) = entry else {
                missing = true;
                return Ok(());
            };
            if let Some(retry_count) = patch.retry_count {
                entry.retry_count = retry_count;
            }
            if let Some(last_attempt) = patch.last_attempt {
                entry.last_attempt = last_attempt;
            }
            self.write_outbox(&entry)
        });
        if let Err(e) = result {
            warn!(outbox_id, "failed to update outbox message: {e}");
        }
        drop(guard);
        if missing {
            drop(lock);
            self.release_lock(OUTBOX_NS, outbox_id);
        }
    }

    /// Bump the retry counter and stamp the attempt time.
    pub fn record_outbox_failure(&self, entry: &OutboxEntry) {
        self.update_outbox_message(
            &entry.outbox_id,
            &OutboxPatch {
                retry_count: Some(entry.retry_count + 1),
                last_attempt: Some(self.clock.now_millis()),
            },
        );
    }

    pub fn remove_outbox_message(&self, outbox_id: &str) {
        self.delete_logged(OUTBOX_NS, outbox_id);
    }

    pub fn clear_outbox(&self) {
        if let Err(e) = self.kv.clear(OUTBOX_NS) {
            warn!("failed to clear outbox: {e}");
            return;
        }
        self.release_locks(OUTBOX_NS);
    }

    /// Whether the entry has used up its automatic retries.
    pub fn is_exhausted(&self, entry: &OutboxEntry) -> bool {
        entry.retry_count >= self.config.max_outbox_retries
    }

    fn read_outbox(&self, outbox_id: &str) -> Result<Option<OutboxEntry>, StoreError> {
        match self.kv.get(OUTBOX_NS, outbox_id)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn write_outbox(&self, entry: &OutboxEntry) -> Result<(), StoreError> {
        let raw = serde_json::to_string(entry)?;
        self.kv.set(OUTBOX_NS, &entry.outbox_id, &raw)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Drop expired and unreadable cache records. Returns how many went.
    pub fn prune_expired_cache_entries(&self) -> usize {
        let keys = match self.kv.keys(CACHE_NS) {
            Ok(keys) => keys,
            Err(e) => {
                warn!("failed to list cache for pruning: {e}");
                return 0;
            }
        };

        let mut pruned = 0;
        for key in keys.iter().filter(|k| k.starts_with(CACHE_KEY_PREFIX)) {
            let stale = match self.read_cached(key) {
                Ok(Some(cached)) => self.is_expired(cached.last_updated),
                Ok(None) => false,
                Err(e) => {
                    debug!(key = %key, "pruning unreadable cache entry: {e}");
                    true
                }
            };
            if stale && self.delete_logged(CACHE_NS, key) {
                pruned += 1;
            }
        }
        pruned
    }

    /// Drop outbox entries that ran out of retries. Returns how many went.
    pub fn prune_exhausted_outbox_entries(&self) -> usize {
        let mut pruned = 0;
        for entry in self.get_outbox_messages(None) {
            if self.is_exhausted(&entry) && self.delete_logged(OUTBOX_NS, &entry.outbox_id) {
                debug!(outbox_id = %entry.outbox_id, retries = entry.retry_count, "pruned exhausted outbox entry");
                pruned += 1;
            }
        }
        pruned
    }

    pub fn storage_info(&self) -> StorageInfo {
        let count = |ns: &str| match self.kv.keys(ns) {
            Ok(keys) => keys.len(),
            Err(e) => {
                warn!(namespace = ns, "failed to count entries: {e}");
                0
            }
        };
        StorageInfo {
            cache_entries: count(CACHE_NS),
            outbox_entries: count(OUTBOX_NS),
        }
    }

    fn delete_logged(&self, namespace: &'static str, key: &str) -> bool {
        match self.kv.delete(namespace, key) {
            Ok(()) => {
                self.release_lock(namespace, key);
                true
            }
            Err(e) => {
                warn!(namespace, key, "failed to delete entry: {e}");
                false
            }
        }
    }
}
