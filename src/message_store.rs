//! Authoritative per-conversation message lists
//!
//! Every write to a conversation's list goes through this store. Optimistic
//! messages move `pending -> sent` (confirm, replaced in place) or
//! `pending -> failed`; nothing leaves `sent` or `failed`.
//!
//! At most `capacity` conversations are cached, evicted least recently
//! touched first. With persistence attached, the cached set is mirrored to
//! the key-value store through a per-instance debounced writer.

mod lru;

pub use lru::RecencyIndex;

use crate::message::{Message, MessageId, MessageStatus, ServerMessage};
use crate::persistence::{load_json, save_json, KeyValueStore, PersistenceResult};
use crate::transport::MessagePage;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub const DEFAULT_CACHE_CAPACITY: usize = 10;
const INDEX_KEY: &str = "messages:index";
const CHANGE_CHANNEL_CAPACITY: usize = 64;

fn conversation_key(conversation_id: &str) -> String {
    format!("messages:{conversation_id}")
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("Unknown conversation: {0}")]
    UnknownConversation(String),
    #[error("Message not found: {0}")]
    MessageNotFound(String),
    #[error("Duplicate message id: {0}")]
    DuplicateId(String),
    #[error("Not an optimistic message: {0}")]
    NotOptimistic(String),
    #[error("Invalid transition for {temp_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        temp_id: String,
        from: MessageStatus,
        to: MessageStatus,
    },
}

/// Cached state of one open conversation
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConversationCache {
    pub conversation_id: String,
    pub messages: Vec<Message>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
    #[serde(skip)]
    pub is_loading_more: bool,
    /// Cursors already fetched; a cursor is never followed twice
    #[serde(default)]
    used_cursors: Vec<String>,
}

impl ConversationCache {
    fn new(conversation_id: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            ..Self::default()
        }
    }

    fn position_of_temp(&self, temp_id: &str) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.temp_id() == Some(temp_id))
    }

    fn position_of_id(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }

    pub fn has_unconfirmed(&self) -> bool {
        self.messages.iter().any(|m| !m.is_confirmed())
    }
}

struct StoreState {
    conversations: HashMap<String, ConversationCache>,
    recency: RecencyIndex,
    /// Conversations whose durable copy is stale (written or deleted on flush)
    dirty: HashSet<String>,
}

impl StoreState {
    /// Mark `conversation_id` most recent and evict past `capacity`.
    /// Conversations holding unconfirmed messages are never evicted.
    fn touch(&mut self, conversation_id: &str, capacity: usize) -> Vec<String> {
        self.recency.touch(conversation_id);
        self.dirty.insert(conversation_id.to_string());

        let mut evicted = Vec::new();
        while self.recency.len() > capacity {
            let victim = self
                .recency
                .oldest_first()
                .find(|id| {
                    *id != conversation_id
                        && !self
                            .conversations
                            .get(*id)
                            .is_some_and(ConversationCache::has_unconfirmed)
                })
                .map(str::to_string);
            let Some(victim) = victim else { break };

            self.recency.remove(&victim);
            self.conversations.remove(&victim);
            self.dirty.insert(victim.clone());
            evicted.push(victim);
        }
        evicted
    }
}

struct StoreInner {
    state: Mutex<StoreState>,
    capacity: usize,
    persistence: Option<Arc<dyn KeyValueStore>>,
    debounce: Duration,
    pending_write: Mutex<Option<JoinHandle<()>>>,
    changes: broadcast::Sender<String>,
}

impl StoreInner {
    fn lock_state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_dirty(&self) -> PersistenceResult<()> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };

        let (snapshots, index) = {
            let mut state = self.lock_state();
            let dirty: Vec<String> = state.dirty.drain().collect();
            let snapshots: Vec<(String, Option<ConversationCache>)> = dirty
                .into_iter()
                .map(|id| {
                    let cache = state.conversations.get(&id).cloned();
                    (id, cache)
                })
                .collect();
            (snapshots, state.recency.most_recent_first())
        };

        let result = snapshots.iter().try_for_each(|(id, cache)| match cache {
            Some(cache) => save_json(persistence.as_ref(), &conversation_key(id), cache),
            None => persistence.delete(&conversation_key(id)),
        });
        let result = result.and_then(|()| save_json(persistence.as_ref(), INDEX_KEY, &index));

        if result.is_err() {
            // Retry these on the next write
            let mut state = self.lock_state();
            state.dirty.extend(snapshots.into_iter().map(|(id, _)| id));
        }
        result
    }

    fn write_dirty_logged(&self) {
        if let Err(e) = self.write_dirty() {
            tracing::warn!(error = %e, "Failed to persist message cache");
        }
    }
}

/// Per-conversation message lists with optimistic delivery states
#[derive(Clone)]
pub struct MessageStore {
    inner: Arc<StoreInner>,
}

impl MessageStore {
    /// In-memory store
    pub fn new(capacity: usize) -> Self {
        Self::build(capacity, None, Duration::ZERO)
    }

    /// Store mirrored to `persistence`, restoring previously cached conversations
    pub fn with_persistence(
        persistence: Arc<dyn KeyValueStore>,
        capacity: usize,
        debounce: Duration,
    ) -> PersistenceResult<Self> {
        let store = Self::build(capacity, Some(persistence), debounce);
        store.hydrate()?;
        Ok(store)
    }

    /// Replace the in-memory caches with the durable copy. Returns how many
    /// conversations were restored.
    pub fn hydrate(&self) -> PersistenceResult<usize> {
        let Some(persistence) = &self.inner.persistence else {
            return Ok(0);
        };
        let ids: Vec<String> = load_json(persistence.as_ref(), INDEX_KEY)?.unwrap_or_default();

        let mut conversations = HashMap::new();
        let mut restored = Vec::new();
        for id in ids.into_iter().take(self.inner.capacity) {
            match load_json::<ConversationCache>(persistence.as_ref(), &conversation_key(&id)) {
                Ok(Some(cache)) => {
                    conversations.insert(id.clone(), cache);
                    restored.push(id);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(conv_id = %id, error = %e, "Dropping unreadable cached conversation");
                }
            }
        }

        let count = restored.len();
        {
            let mut state = self.inner.lock_state();
            state.conversations = conversations;
            state.recency = RecencyIndex::from_ids(restored);
            state.dirty.clear();
        }

        tracing::debug!(count, "Restored cached conversations");
        Ok(count)
    }

    fn build(
        capacity: usize,
        persistence: Option<Arc<dyn KeyValueStore>>,
        debounce: Duration,
    ) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(StoreState {
                    conversations: HashMap::new(),
                    recency: RecencyIndex::default(),
                    dirty: HashSet::new(),
                }),
                capacity: capacity.max(1),
                persistence,
                debounce,
                pending_write: Mutex::new(None),
                changes,
            }),
        }
    }

    /// Conversation ids whose list changed
    pub fn subscribe_changes(&self) -> broadcast::Receiver<String> {
        self.inner.changes.subscribe()
    }

    // ==================== Reads ====================

    pub fn get_messages(&self, conversation_id: &str) -> Vec<Message> {
        self.inner
            .lock_state()
            .conversations
            .get(conversation_id)
            .map(|cache| cache.messages.clone())
            .unwrap_or_default()
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<ConversationCache> {
        self.inner
            .lock_state()
            .conversations
            .get(conversation_id)
            .cloned()
    }

    pub fn find_unconfirmed(&self, conversation_id: &str, temp_id: &str) -> Option<Message> {
        let state = self.inner.lock_state();
        let cache = state.conversations.get(conversation_id)?;
        cache
            .position_of_temp(temp_id)
            .map(|pos| cache.messages[pos].clone())
    }

    /// Cached conversation ids, most recently touched first
    pub fn cached_conversations(&self) -> Vec<String> {
        self.inner.lock_state().recency.most_recent_first()
    }

    // ==================== Transitions ====================

    /// Append a `pending` message; visible immediately
    pub fn add_optimistic_message(
        &self,
        conversation_id: &str,
        message: Message,
    ) -> Result<(), StoreError> {
        let Some(temp_id) = message.temp_id().map(str::to_string) else {
            return Err(StoreError::NotOptimistic(message.id.to_string()));
        };
        if message.status != MessageStatus::Pending {
            return Err(StoreError::InvalidTransition {
                temp_id,
                from: message.status,
                to: MessageStatus::Pending,
            });
        }

        self.update(conversation_id, true, |cache| {
            if cache.position_of_temp(&temp_id).is_some() {
                return Err(StoreError::DuplicateId(temp_id.clone()));
            }
            cache.messages.push(message);
            Ok(())
        })?;

        tracing::debug!(conv_id = %conversation_id, temp_id = %temp_id, "Optimistic message added");
        Ok(())
    }

    /// Replace the pending message in place with its server-confirmed form
    pub fn confirm_message(
        &self,
        conversation_id: &str,
        temp_id: &str,
        server_message: ServerMessage,
    ) -> Result<(), StoreError> {
        let server_id = server_message.id.clone();
        self.update(conversation_id, false, |cache| {
            let mut pos = cache
                .position_of_temp(temp_id)
                .ok_or_else(|| StoreError::MessageNotFound(temp_id.to_string()))?;

            let status = cache.messages[pos].status;
            if status != MessageStatus::Pending {
                return Err(StoreError::InvalidTransition {
                    temp_id: temp_id.to_string(),
                    from: status,
                    to: MessageStatus::Sent,
                });
            }

            // The server copy may already be here from a page fetch
            let confirmed = Message::from(server_message);
            if let Some(existing) = cache.position_of_id(&confirmed.id) {
                cache.messages.remove(existing);
                if existing < pos {
                    pos -= 1;
                }
            }
            cache.messages[pos] = confirmed;
            Ok(())
        })?;

        tracing::info!(conv_id = %conversation_id, temp_id = %temp_id, server_id = %server_id, "Message confirmed");
        Ok(())
    }

    /// `pending -> failed`; repeating it on a failed message is a no-op
    pub fn mark_message_failed(&self, conversation_id: &str, temp_id: &str) -> Result<(), StoreError> {
        self.update(conversation_id, false, |cache| {
            let pos = cache
                .position_of_temp(temp_id)
                .ok_or_else(|| StoreError::MessageNotFound(temp_id.to_string()))?;
            cache.messages[pos].status = MessageStatus::Failed;
            Ok(())
        })?;

        tracing::warn!(conv_id = %conversation_id, temp_id = %temp_id, "Message marked failed");
        Ok(())
    }

    /// Extend a pending message's content (streamed reply)
    pub fn append_content(
        &self,
        conversation_id: &str,
        temp_id: &str,
        delta: &str,
    ) -> Result<(), StoreError> {
        self.update(conversation_id, false, |cache| {
            let pos = cache
                .position_of_temp(temp_id)
                .ok_or_else(|| StoreError::MessageNotFound(temp_id.to_string()))?;
            let message = &mut cache.messages[pos];
            if message.status != MessageStatus::Pending {
                return Err(StoreError::InvalidTransition {
                    temp_id: temp_id.to_string(),
                    from: message.status,
                    to: MessageStatus::Pending,
                });
            }
            message.content.push_str(delta);
            Ok(())
        })
    }

    /// Drop an unconfirmed message (user delete, manual retry, empty stopped reply)
    pub fn remove_message(&self, conversation_id: &str, temp_id: &str) -> Result<Message, StoreError> {
        let removed = self.update(conversation_id, false, |cache| {
            let pos = cache
                .position_of_temp(temp_id)
                .ok_or_else(|| StoreError::MessageNotFound(temp_id.to_string()))?;
            Ok(cache.messages.remove(pos))
        })?;

        tracing::debug!(conv_id = %conversation_id, temp_id = %temp_id, "Unconfirmed message removed");
        Ok(removed)
    }

    /// Re-show an unconfirmed message (e.g. a queued one after a conversation
    /// switch). Returns false if it is already present.
    pub fn restore_message(&self, conversation_id: &str, message: Message) -> Result<bool, StoreError> {
        let Some(temp_id) = message.temp_id().map(str::to_string) else {
            return Err(StoreError::NotOptimistic(message.id.to_string()));
        };
        self.update(conversation_id, true, |cache| {
            if cache.position_of_temp(&temp_id).is_some() {
                return Ok(false);
            }
            cache.messages.push(message);
            Ok(true)
        })
    }

    // ==================== Pagination ====================

    /// Replace the list with the newest page. Unconfirmed local messages
    /// stay, after the page.
    pub fn replace_page(&self, conversation_id: &str, page: MessagePage) -> Result<(), StoreError> {
        self.update(conversation_id, true, |cache| {
            let unconfirmed: Vec<Message> = cache
                .messages
                .drain(..)
                .filter(|m| !m.is_confirmed())
                .collect();

            let mut messages: Vec<Message> = Vec::with_capacity(page.messages.len() + unconfirmed.len());
            for message in page.messages.into_iter().map(Message::from) {
                if !messages.iter().any(|m| m.id == message.id) {
                    messages.push(message);
                }
            }
            messages.extend(unconfirmed);

            cache.messages = messages;
            cache.next_cursor = page.next_cursor;
            cache.has_more = page.has_more;
            cache.used_cursors.clear();
            cache.is_loading_more = false;
            Ok(())
        })
    }

    /// Claim the single in-flight older-page fetch. Returns the cursor to
    /// fetch with, or `None` if there is nothing to load or a load is running.
    pub fn begin_load_more(&self, conversation_id: &str) -> Option<String> {
        let mut state = self.inner.lock_state();
        let cache = state.conversations.get_mut(conversation_id)?;
        if !cache.has_more || cache.is_loading_more {
            return None;
        }
        let cursor = cache.next_cursor.clone()?;
        cache.is_loading_more = true;
        Some(cursor)
    }

    /// Release the in-flight claim after a failed fetch
    pub fn abort_load_more(&self, conversation_id: &str) {
        let mut state = self.inner.lock_state();
        if let Some(cache) = state.conversations.get_mut(conversation_id) {
            cache.is_loading_more = false;
        }
    }

    /// Prepend an older page fetched with `cursor`. Returns how many
    /// messages were added; a page made stale by `clear` is discarded.
    pub fn prepend_page(
        &self,
        conversation_id: &str,
        cursor: &str,
        page: MessagePage,
    ) -> Result<usize, StoreError> {
        self.update(conversation_id, false, |cache| {
            if !cache.is_loading_more || cache.next_cursor.as_deref() != Some(cursor) {
                tracing::debug!(conv_id = %cache.conversation_id, cursor, "Discarding stale page");
                return Ok(0);
            }

            let mut older: Vec<Message> = Vec::with_capacity(page.messages.len());
            for message in page.messages.into_iter().map(Message::from) {
                let seen = cache.position_of_id(&message.id).is_some()
                    || older.iter().any(|m| m.id == message.id);
                if !seen {
                    older.push(message);
                }
            }
            let added = older.len();
            older.append(&mut cache.messages);
            cache.messages = older;

            cache.used_cursors.push(cursor.to_string());
            let repeated = page
                .next_cursor
                .as_ref()
                .is_some_and(|next| cache.used_cursors.contains(next));
            if repeated {
                tracing::warn!(conv_id = %cache.conversation_id, cursor = ?page.next_cursor, "Server repeated a cursor, ending pagination");
                cache.has_more = false;
                cache.next_cursor = None;
            } else {
                cache.has_more = page.has_more;
                cache.next_cursor = page.next_cursor;
            }
            cache.is_loading_more = false;
            Ok(added)
        })
    }

    /// Reset cursor, `has_more` and the list together
    pub fn clear_conversation(&self, conversation_id: &str) {
        let cleared = {
            let mut state = self.inner.lock_state();
            let cleared = match state.conversations.get_mut(conversation_id) {
                Some(cache) => {
                    *cache = ConversationCache::new(conversation_id);
                    true
                }
                None => false,
            };
            if cleared {
                state.dirty.insert(conversation_id.to_string());
            }
            cleared
        };

        if cleared {
            tracing::debug!(conv_id = %conversation_id, "Conversation cleared");
            self.after_change(conversation_id);
        }
    }

    // ==================== Persistence ====================

    /// Write all pending changes now, cancelling any scheduled write
    pub fn flush_persistence(&self) -> PersistenceResult<()> {
        if let Some(pending) = self
            .inner
            .pending_write
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pending.abort();
        }
        self.inner.write_dirty()
    }

    fn update<T>(
        &self,
        conversation_id: &str,
        create: bool,
        f: impl FnOnce(&mut ConversationCache) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let (result, evicted) = {
            let mut state = self.inner.lock_state();
            let cache = if create {
                state
                    .conversations
                    .entry(conversation_id.to_string())
                    .or_insert_with(|| ConversationCache::new(conversation_id))
            } else {
                state
                    .conversations
                    .get_mut(conversation_id)
                    .ok_or_else(|| StoreError::UnknownConversation(conversation_id.to_string()))?
            };
            let result = f(cache)?;
            let evicted = state.touch(conversation_id, self.inner.capacity);
            (result, evicted)
        };

        for id in &evicted {
            tracing::info!(conv_id = %id, "Evicted cached conversation");
        }
        self.after_change(conversation_id);
        Ok(result)
    }

    fn after_change(&self, conversation_id: &str) {
        let _ = self.inner.changes.send(conversation_id.to_string());
        self.schedule_persist();
    }

    fn schedule_persist(&self) {
        if self.inner.persistence.is_none() {
            return;
        }
        if self.inner.debounce.is_zero() {
            self.inner.write_dirty_logged();
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.inner.write_dirty_logged();
            return;
        };

        let weak: Weak<StoreInner> = Arc::downgrade(&self.inner);
        let delay = self.inner.debounce;
        let mut pending = self
            .inner
            .pending_write
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = pending.take() {
            previous.abort();
        }
        *pending = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.write_dirty_logged();
            }
        }));
    }
}
