//! Durable FIFO of undelivered messages
//!
//! Entries survive restarts through the key-value store and are drained in
//! enqueue order per conversation. Only one flush runs at a time; callers
//! that race an active flush get `None` back without touching the queue.

#[cfg(test)]
mod proptests;

use crate::message::Message;
use crate::message_store::MessageStore;
use crate::persistence::{load_json, save_json, KeyValueStore, PersistenceError};
use crate::retry::{with_retry, RetryError, RetryOptions};
use crate::transport::MessageApi;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

const QUEUE_KEY: &str = "offline_queue";
const DELIVERY_CHANNEL_CAPACITY: usize = 64;

/// A message waiting for delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedEntry {
    pub conversation_id: String,
    pub message: Message,
    pub enqueued_at: DateTime<Utc>,
    /// Retries were exhausted; automatic flushes skip it until it is
    /// discarded or retried by hand
    #[serde(default)]
    pub held: bool,
}

impl QueuedEntry {
    fn temp_id(&self) -> Option<&str> {
        self.message.temp_id()
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Not an optimistic message: {0}")]
    NotOptimistic(String),
    #[error("Already queued: {0}")]
    AlreadyQueued(String),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// A queued message the server accepted during a flush
#[derive(Debug, Clone, PartialEq)]
pub struct Delivered {
    pub conversation_id: String,
    pub temp_id: String,
    /// The confirmed message as returned by the server
    pub message: Message,
}

/// Outcome of one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub delivered: usize,
    pub failed: usize,
    pub skipped: usize,
}

type ConnectivityCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Disposer returned by [`OfflineQueue::on_connectivity_change`].
/// Dropping it unsubscribes.
#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct Subscription {
    queue: Weak<QueueInner>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.queue.upgrade() {
            inner
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|(id, _)| *id != self.id);
        }
    }
}

/// Held while a flush runs; releases the single-flight flag on drop
struct FlushGuard<'a>(&'a AtomicBool);

impl<'a> FlushGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct QueueInner {
    kv: Arc<dyn KeyValueStore>,
    api: Arc<dyn MessageApi>,
    store: MessageStore,
    retry: RetryOptions,
    entries: Mutex<Vec<QueuedEntry>>,
    /// The durable copy is behind `entries`
    unsaved: AtomicBool,
    flushing: AtomicBool,
    deliveries: broadcast::Sender<Delivered>,
    online: watch::Sender<bool>,
    listeners: Mutex<Vec<(u64, ConnectivityCallback)>>,
    next_listener: AtomicU64,
}

/// Offline queue with connectivity tracking
#[derive(Clone)]
pub struct OfflineQueue {
    inner: Arc<QueueInner>,
}

impl OfflineQueue {
    /// Restore persisted entries. Starts online.
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        api: Arc<dyn MessageApi>,
        store: MessageStore,
        retry: RetryOptions,
    ) -> Result<Self, QueueError> {
        let entries: Vec<QueuedEntry> = load_json(kv.as_ref(), QUEUE_KEY)?.unwrap_or_default();
        if !entries.is_empty() {
            tracing::info!(count = entries.len(), "Restored queued messages");
        }

        let (online, _) = watch::channel(true);
        let (deliveries, _) = broadcast::channel(DELIVERY_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(QueueInner {
                kv,
                api,
                store,
                retry,
                entries: Mutex::new(entries),
                unsaved: AtomicBool::new(false),
                flushing: AtomicBool::new(false),
                deliveries,
                online,
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(0),
            }),
        })
    }

    fn lock_entries(&self) -> MutexGuard<'_, Vec<QueuedEntry>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, entries: &[QueuedEntry]) -> Result<(), QueueError> {
        save_json(self.inner.kv.as_ref(), QUEUE_KEY, &entries)?;
        self.inner.unsaved.store(false, Ordering::Release);
        Ok(())
    }

    /// Rewrite the durable copy if an earlier write failed
    fn persist_if_unsaved(&self) {
        if !self.inner.unsaved.load(Ordering::Acquire) {
            return;
        }
        let entries = self.lock_entries();
        match self.persist(&entries) {
            Ok(()) => tracing::info!(count = entries.len(), "Queue saved after earlier failure"),
            Err(e) => tracing::warn!(error = %e, "Queue still not saved"),
        }
    }

    /// Messages accepted by the server during flushes
    pub fn subscribe_deliveries(&self) -> broadcast::Receiver<Delivered> {
        self.inner.deliveries.subscribe()
    }

    /// Whether `conversation_id` has entries an automatic flush will send
    pub fn has_deliverable(&self, conversation_id: &str) -> bool {
        self.lock_entries()
            .iter()
            .any(|e| e.conversation_id == conversation_id && !e.held)
    }

    // ==================== Entries ====================

    /// Durably append a message for later delivery
    pub fn enqueue(&self, conversation_id: &str, message: Message) -> Result<(), QueueError> {
        self.push(conversation_id, message, false)
    }

    /// Durably keep a message whose delivery was given up on, so the user
    /// can retry or discard it later
    pub fn enqueue_held(&self, conversation_id: &str, message: Message) -> Result<(), QueueError> {
        self.push(conversation_id, message, true)
    }

    fn push(&self, conversation_id: &str, message: Message, held: bool) -> Result<(), QueueError> {
        let Some(temp_id) = message.temp_id().map(str::to_string) else {
            return Err(QueueError::NotOptimistic(message.id.to_string()));
        };

        let mut entries = self.lock_entries();
        if entries
            .iter()
            .any(|e| e.conversation_id == conversation_id && e.temp_id() == Some(temp_id.as_str()))
        {
            return Err(QueueError::AlreadyQueued(temp_id));
        }

        entries.push(QueuedEntry {
            conversation_id: conversation_id.to_string(),
            message,
            enqueued_at: Utc::now(),
            held,
        });
        if let Err(e) = self.persist(&entries) {
            entries.pop();
            return Err(e);
        }
        drop(entries);

        tracing::info!(conv_id = %conversation_id, temp_id = %temp_id, held, "Message queued");
        Ok(())
    }

    /// Remove an entry (user delete or manual retry)
    pub fn discard(
        &self,
        conversation_id: &str,
        temp_id: &str,
    ) -> Result<Option<QueuedEntry>, QueueError> {
        let removed = self.take_entry(conversation_id, temp_id)?;
        if removed.is_some() {
            tracing::info!(conv_id = %conversation_id, temp_id = %temp_id, "Queued message discarded");
        }
        Ok(removed)
    }

    /// Entries in enqueue order, optionally for one conversation
    pub fn get_queued_messages(&self, conversation_id: Option<&str>) -> Vec<QueuedEntry> {
        self.lock_entries()
            .iter()
            .filter(|e| conversation_id.map_or(true, |id| e.conversation_id == id))
            .cloned()
            .collect()
    }

    pub fn contains(&self, conversation_id: &str, temp_id: &str) -> bool {
        self.lock_entries()
            .iter()
            .any(|e| e.conversation_id == conversation_id && e.temp_id() == Some(temp_id))
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    fn take_entry(
        &self,
        conversation_id: &str,
        temp_id: &str,
    ) -> Result<Option<QueuedEntry>, QueueError> {
        let mut entries = self.lock_entries();
        let Some(pos) = entries
            .iter()
            .position(|e| e.conversation_id == conversation_id && e.temp_id() == Some(temp_id))
        else {
            return Ok(None);
        };

        let removed = entries.remove(pos);
        if let Err(e) = self.persist(&entries) {
            entries.insert(pos, removed);
            return Err(e);
        }
        Ok(Some(removed))
    }

    /// Drop an entry the server already accepted. The entry leaves memory
    /// even if the durable write fails; that write is retried later.
    fn remove_delivered(&self, conversation_id: &str, temp_id: &str) {
        let mut entries = self.lock_entries();
        entries.retain(|e| !(e.conversation_id == conversation_id && e.temp_id() == Some(temp_id)));
        if let Err(e) = self.persist(&entries) {
            self.inner.unsaved.store(true, Ordering::Release);
            tracing::warn!(conv_id = %conversation_id, temp_id = %temp_id, error = %e, "Delivered entry removed but queue not saved");
        }
    }

    fn hold_entry(&self, conversation_id: &str, temp_id: &str) -> Result<(), QueueError> {
        let mut entries = self.lock_entries();
        if let Some(entry) = entries
            .iter_mut()
            .find(|e| e.conversation_id == conversation_id && e.temp_id() == Some(temp_id))
        {
            entry.held = true;
        }
        self.persist(&entries)
            .inspect_err(|_| self.inner.unsaved.store(true, Ordering::Release))
    }

    // ==================== Draining ====================

    /// Deliver queued entries. Returns `None` if another flush is running.
    ///
    /// Held entries are skipped. An entry that exhausts its retries is held,
    /// its message is marked failed, and the rest of its conversation waits
    /// for the next pass. Entries enqueued while the flush runs are drained
    /// by the same flush.
    pub async fn flush(&self) -> Result<Option<FlushReport>, QueueError> {
        let Some(_guard) = FlushGuard::acquire(&self.inner.flushing) else {
            tracing::debug!("Flush already in progress, skipping");
            return Ok(None);
        };
        self.persist_if_unsaved();

        let mut report = FlushReport::default();
        let mut stalled: HashSet<String> = HashSet::new();
        let mut seen: HashSet<(String, String)> = HashSet::new();

        loop {
            let batch: Vec<QueuedEntry> = self
                .get_queued_messages(None)
                .into_iter()
                .filter(|e| {
                    e.temp_id().is_some_and(|temp_id| {
                        seen.insert((e.conversation_id.clone(), temp_id.to_string()))
                    })
                })
                .collect();
            if batch.is_empty() {
                break;
            }
            for entry in batch {
                self.flush_entry(&entry, &mut stalled, &mut report).await?;
            }
        }

        tracing::info!(
            delivered = report.delivered,
            failed = report.failed,
            skipped = report.skipped,
            "Queue flushed"
        );
        Ok(Some(report))
    }

    async fn flush_entry(
        &self,
        entry: &QueuedEntry,
        stalled: &mut HashSet<String>,
        report: &mut FlushReport,
    ) -> Result<(), QueueError> {
        let conversation_id = entry.conversation_id.as_str();
        let Some(temp_id) = entry.temp_id() else {
            return Ok(());
        };
        if entry.held || stalled.contains(conversation_id) || !self.is_online() {
            report.skipped += 1;
            return Ok(());
        }
        // Discarded while an earlier entry was in flight
        if !self.contains(conversation_id, temp_id) {
            return Ok(());
        }

        let api = &self.inner.api;
        let draft = entry.message.draft();
        let result = with_retry(
            || api.post_message(conversation_id, &draft),
            &self.inner.retry,
        )
        .await;

        match result {
            Ok(server_message) => {
                let message = Message::from(server_message.clone());
                if let Err(e) =
                    self.inner
                        .store
                        .confirm_message(conversation_id, temp_id, server_message)
                {
                    tracing::debug!(conv_id = %conversation_id, temp_id = %temp_id, error = %e, "Delivered message not in cache");
                }
                self.remove_delivered(conversation_id, temp_id);
                report.delivered += 1;
                let _ = self.inner.deliveries.send(Delivered {
                    conversation_id: conversation_id.to_string(),
                    temp_id: temp_id.to_string(),
                    message,
                });
            }
            Err(RetryError::Cancelled) => {
                report.skipped += 1;
                stalled.insert(conversation_id.to_string());
            }
            Err(err) => {
                tracing::warn!(conv_id = %conversation_id, temp_id = %temp_id, error = %err, "Queued delivery failed, holding entry");
                stalled.insert(conversation_id.to_string());
                report.failed += 1;
                if let Err(e) = self.inner.store.mark_message_failed(conversation_id, temp_id) {
                    tracing::debug!(conv_id = %conversation_id, temp_id = %temp_id, error = %e, "Failed message not in cache");
                }
                self.hold_entry(conversation_id, temp_id)?;
            }
        }
        Ok(())
    }

    async fn flush_logged(&self) {
        if let Err(e) = self.flush().await {
            tracing::error!(error = %e, "Queue flush failed");
        }
    }

    // ==================== Connectivity ====================

    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }

    /// Update the connectivity flag. Returns true if it changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.inner.online.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if !changed {
            return false;
        }

        tracing::info!(online, "Connectivity changed");
        let listeners: Vec<ConnectivityCallback> = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in listeners {
            callback(online);
        }
        true
    }

    /// Connectivity as a watch channel
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.online.subscribe()
    }

    /// Call `callback` on every connectivity change until the returned
    /// subscription is dropped
    pub fn on_connectivity_change(
        &self,
        callback: impl Fn(bool) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));
        Subscription {
            queue: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Follow an external connectivity signal, flushing whenever it goes
    /// online. Ends when the signal's sender is dropped.
    pub fn watch_connectivity(&self, mut signal: watch::Receiver<bool>) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            let online = *signal.borrow_and_update();
            queue.set_online(online);
            if online && !queue.is_empty() {
                queue.flush_logged().await;
            }

            while signal.changed().await.is_ok() {
                let online = *signal.borrow_and_update();
                if queue.set_online(online) && online {
                    queue.flush_logged().await;
                }
            }
            tracing::debug!("Connectivity signal closed");
        })
    }
}
