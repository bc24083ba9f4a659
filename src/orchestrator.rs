//! Chat orchestration
//!
//! One user turn is: optimistic add, delivery through the retry engine,
//! confirmation in place, then a single streaming completion exchange whose
//! reply enters the store as a pending assistant message and is confirmed
//! once persisted. Tool calls found in the stream go to the conversation's
//! gate and wait for the user.
//!
//! `stop()` cancels every exchange started before it, including any backoff
//! sleep in progress. Tool executions are not affected.

mod events;

pub use events::ChatEvent;

use crate::message::{Message, MessageDraft, MessageRole, MessageStatus};
use crate::message_store::{MessageStore, StoreError};
use crate::offline_queue::{Delivered, FlushReport, OfflineQueue, QueueError};
use crate::pagination::{LoadMore, PaginationController, PaginationError};
use crate::retry::{with_retry, with_streaming_retry, RetryError, RetryOptions};
use crate::tool_gate::{GateError, ToolCall, ToolCallGate, ToolCallState};
use crate::transport::{
    CompletionChunk, CompletionRequest, CompletionService, MessageApi, ToolCallRequest,
    ToolExecutor,
};
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum ChatError {
    /// The user message could not be delivered and was not queued
    #[error("Message not delivered: {0}")]
    Delivery(RetryError),
    /// The user message is persisted but the assistant reply failed
    #[error("Reply failed: {0}")]
    Reply(RetryError),
    #[error("Offline")]
    Offline,
    #[error("No unconfirmed message to retry")]
    NothingToRetry,
    #[error("No exchange to reload")]
    NothingToReload,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    Pagination(#[from] PaginationError),
}

/// Result of sending a user message
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Offline: waiting in the queue for connectivity
    Queued { temp_id: String },
    /// Delivery gave up; the message is failed and kept for a manual retry
    Failed { temp_id: String, error: RetryError },
    /// Persisted with `message_id`, then answered
    Sent { message_id: String, reply: Reply },
}

/// Outcome of one completion exchange
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// The assistant message as stored; `None` when no text was produced
    pub message: Option<Message>,
    /// Tool call proposed during this exchange
    pub tool_call: Option<ToolCall>,
    /// Ended by `stop()`
    pub stopped: bool,
}

/// A submitted input form
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormSubmission {
    pub input: String,
}

/// External collaborators
#[derive(Clone)]
pub struct ChatServices {
    pub api: Arc<dyn MessageApi>,
    pub completions: Arc<dyn CompletionService>,
    pub tools: Arc<dyn ToolExecutor>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub conversation_id: String,
    pub retry: RetryOptions,
    pub page_size: usize,
    /// Sent with every completion request
    pub metadata: Value,
}

pub struct ChatOrchestrator {
    services: ChatServices,
    store: MessageStore,
    queue: OfflineQueue,
    pagination: PaginationController,
    retry: RetryOptions,
    metadata: Value,
    conversation_id: Mutex<String>,
    gates: Mutex<HashMap<String, ToolCallGate>>,
    /// Parent of every running exchange's token; replaced on `stop()`
    stop: Mutex<CancellationToken>,
    events: broadcast::Sender<ChatEvent>,
    _connectivity: crate::offline_queue::Subscription,
}

impl ChatOrchestrator {
    pub fn new(
        services: ChatServices,
        store: MessageStore,
        queue: OfflineQueue,
        options: OrchestratorOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let connectivity_events = events.clone();
        let connectivity = queue.on_connectivity_change(move |online| {
            let _ = connectivity_events.send(ChatEvent::ConnectivityChanged { online });
        });

        let pagination =
            PaginationController::new(Arc::clone(&services.api), store.clone(), options.page_size);

        Self {
            services,
            store,
            queue,
            pagination,
            retry: options.retry,
            metadata: options.metadata,
            conversation_id: Mutex::new(options.conversation_id),
            gates: Mutex::new(HashMap::new()),
            stop: Mutex::new(CancellationToken::new()),
            events,
            _connectivity: connectivity,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub fn conversation_id(&self) -> String {
        lock(&self.conversation_id).clone()
    }

    /// Current conversation's messages
    pub fn messages(&self) -> Vec<Message> {
        self.store.get_messages(&self.conversation_id())
    }

    /// Follow the connectivity signal, forward store changes as events and
    /// answer user messages the offline queue delivers. Each task ends when
    /// its source closes.
    pub fn spawn_background(self: &Arc<Self>, signal: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let watcher = self.queue.watch_connectivity(signal);

        let mut changes = self.store.subscribe_changes();
        let events = self.events.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(conversation_id) => {
                        let _ = events.send(ChatEvent::MessagesChanged { conversation_id });
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Store change events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let mut deliveries = self.queue.subscribe_deliveries();
        let chat = Arc::downgrade(self);
        let replier = tokio::spawn(async move {
            loop {
                match deliveries.recv().await {
                    Ok(delivered) => {
                        let Some(chat) = chat.upgrade() else {
                            break;
                        };
                        chat.reply_to_delivered(&delivered).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Delivery events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        vec![watcher, forwarder, replier]
    }

    // ==================== Sending ====================

    /// Send a user message in the current conversation
    pub async fn append(&self, content: &str) -> Result<SendOutcome, ChatError> {
        let conversation_id = self.conversation_id();
        if !self.queue.is_online() {
            return self.queue_message(&conversation_id, content);
        }
        if self.queue.has_deliverable(&conversation_id) {
            // Earlier messages are still queued; this one goes behind them
            let outcome = self.queue_message(&conversation_id, content)?;
            self.queue.flush().await?;
            return Ok(outcome);
        }

        let message = Message::optimistic(MessageRole::User, content);
        let temp_id = message.id.as_str().to_string();
        self.store
            .add_optimistic_message(&conversation_id, message.clone())?;

        let token = self.exchange_token();
        let options = self.retry_options(&conversation_id, &token);
        let draft = message.draft();
        let api = &self.services.api;
        let delivery = with_retry(|| api.post_message(&conversation_id, &draft), &options).await;

        match delivery {
            Ok(server_message) => {
                let message_id = server_message.id.clone();
                self.store
                    .confirm_message(&conversation_id, &temp_id, server_message)?;
                let reply = self.stream_reply(&conversation_id, &token).await?;
                Ok(SendOutcome::Sent { message_id, reply })
            }
            Err(RetryError::Rejected(e)) => {
                self.store.mark_message_failed(&conversation_id, &temp_id)?;
                self.notify(&conversation_id, format!("Message not sent: {e}"), false);
                Err(ChatError::Delivery(RetryError::Rejected(e)))
            }
            Err(error) => {
                // Exhausted, or stopped mid-delivery: keep it for a manual retry
                self.queue.enqueue_held(&conversation_id, message)?;
                self.store.mark_message_failed(&conversation_id, &temp_id)?;
                self.notify(&conversation_id, format!("Message not sent: {error}"), true);
                Ok(SendOutcome::Failed { temp_id, error })
            }
        }
    }

    /// Submit the input form; blank input is ignored
    pub async fn submit(&self, form: FormSubmission) -> Result<Option<SendOutcome>, ChatError> {
        let FormSubmission { input } = form;
        let content = input.trim();
        if content.is_empty() {
            return Ok(None);
        }
        if !self.queue.is_online() {
            return self
                .queue_message(&self.conversation_id(), content)
                .map(Some);
        }
        self.append(content).await.map(Some)
    }

    /// Resend the most recent unconfirmed user message
    pub async fn retry(&self) -> Result<SendOutcome, ChatError> {
        let conversation_id = self.conversation_id();
        let message = self
            .store
            .get_messages(&conversation_id)
            .into_iter()
            .rev()
            .find(|m| m.role == MessageRole::User && !m.is_confirmed())
            .ok_or(ChatError::NothingToRetry)?;
        let temp_id = message.id.as_str();

        self.queue.discard(&conversation_id, temp_id)?;
        self.store.remove_message(&conversation_id, temp_id)?;
        tracing::info!(conv_id = %conversation_id, temp_id = %temp_id, "Retrying message");

        self.append(&message.content).await
    }

    /// Re-run the last exchange; confirmed history is left untouched
    pub async fn reload(&self) -> Result<Reply, ChatError> {
        if !self.queue.is_online() {
            return Err(ChatError::Offline);
        }
        let conversation_id = self.conversation_id();
        let token = self.exchange_token();
        self.stream_reply(&conversation_id, &token).await
    }

    /// Cancel every running exchange and its pending backoff
    pub fn stop(&self) {
        let mut stop = lock(&self.stop);
        stop.cancel();
        *stop = CancellationToken::new();
        tracing::info!("Stop requested");
    }

    /// Drop an unconfirmed message and its queue entry
    pub fn discard(&self, temp_id: &str) -> Result<bool, ChatError> {
        let conversation_id = self.conversation_id();
        let queued = self.queue.discard(&conversation_id, temp_id)?.is_some();
        let removed = match self.store.remove_message(&conversation_id, temp_id) {
            Ok(_) => true,
            Err(StoreError::MessageNotFound(_) | StoreError::UnknownConversation(_)) => false,
            Err(e) => return Err(e.into()),
        };
        Ok(queued || removed)
    }

    /// Drain the offline queue now
    pub async fn flush(&self) -> Result<Option<FlushReport>, ChatError> {
        Ok(self.queue.flush().await?)
    }

    fn queue_message(&self, conversation_id: &str, content: &str) -> Result<SendOutcome, ChatError> {
        let message = Message::optimistic(MessageRole::User, content);
        let temp_id = message.id.as_str().to_string();
        self.store
            .add_optimistic_message(conversation_id, message.clone())?;
        self.queue.enqueue(conversation_id, message)?;
        tracing::info!(conv_id = %conversation_id, temp_id = %temp_id, online = self.queue.is_online(), "Message sent through queue");
        Ok(SendOutcome::Queued { temp_id })
    }

    // ==================== Completion exchange ====================

    async fn stream_reply(
        &self,
        conversation_id: &str,
        token: &CancellationToken,
    ) -> Result<Reply, ChatError> {
        let messages = self
            .reply_history(conversation_id)
            .ok_or(ChatError::NothingToReload)?;
        let request = CompletionRequest {
            conversation_id: conversation_id.to_string(),
            messages,
            metadata: self.metadata.clone(),
        };

        let placeholder = Message::optimistic(MessageRole::Assistant, "");
        let temp_id = placeholder.id.as_str().to_string();
        self.store.add_optimistic_message(conversation_id, placeholder)?;

        let completions = Arc::clone(&self.services.completions);
        let mut stream = with_streaming_retry(
            move || completions.stream(request.clone()),
            self.retry_options(conversation_id, token),
        );

        let mut text_received = false;
        let mut tool_call = None;
        let mut failure = None;
        while let Some(item) = stream.next().await {
            match item {
                Ok(CompletionChunk::Text(delta)) => {
                    text_received |= !delta.is_empty();
                    self.store.append_content(conversation_id, &temp_id, &delta)?;
                    let _ = self.events.send(ChatEvent::AssistantDelta {
                        conversation_id: conversation_id.to_string(),
                        temp_id: temp_id.clone(),
                        delta,
                    });
                }
                Ok(CompletionChunk::ToolCall(request)) => {
                    if let Some(call) = self.propose_tool(conversation_id, request) {
                        tool_call = Some(call);
                    }
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let stopped = match failure {
            None => false,
            Some(RetryError::Cancelled) => true,
            Some(error) => {
                if text_received {
                    self.store.mark_message_failed(conversation_id, &temp_id)?;
                } else {
                    self.store.remove_message(conversation_id, &temp_id)?;
                }
                self.notify(conversation_id, format!("Reply failed: {error}"), true);
                return Err(ChatError::Reply(error));
            }
        };

        if !text_received {
            self.store.remove_message(conversation_id, &temp_id)?;
            return Ok(Reply {
                message: None,
                tool_call,
                stopped,
            });
        }

        // Partial output kept after a stop is saved outside the cancelled scope
        let options = if stopped {
            self.retry_options(conversation_id, &CancellationToken::new())
        } else {
            self.retry_options(conversation_id, token)
        };
        let message = self.persist_reply(conversation_id, &temp_id, &options).await?;

        tracing::info!(conv_id = %conversation_id, stopped, chars = message.content.len(), "Reply finished");
        Ok(Reply {
            message: Some(message),
            tool_call,
            stopped,
        })
    }

    /// Answer a user message delivered by a flush once its conversation has
    /// nothing else left to send
    async fn reply_to_delivered(&self, delivered: &Delivered) {
        let conversation_id = delivered.conversation_id.as_str();
        if delivered.message.role != MessageRole::User
            || self.queue.has_deliverable(conversation_id)
            || !self.awaits_reply(conversation_id)
        {
            return;
        }

        tracing::info!(conv_id = %conversation_id, temp_id = %delivered.temp_id, "Replying to queued message");
        let token = self.exchange_token();
        if let Err(e) = self.stream_reply(conversation_id, &token).await {
            tracing::warn!(conv_id = %conversation_id, error = %e, "Reply to queued message failed");
        }
    }

    /// The newest confirmed message is the user's
    fn awaits_reply(&self, conversation_id: &str) -> bool {
        self.store
            .get_messages(conversation_id)
            .iter()
            .rev()
            .find(|m| m.is_confirmed())
            .is_some_and(|m| m.role == MessageRole::User)
    }

    /// Confirmed messages up to the last user message
    fn reply_history(&self, conversation_id: &str) -> Option<Vec<MessageDraft>> {
        let confirmed: Vec<Message> = self
            .store
            .get_messages(conversation_id)
            .into_iter()
            .filter(|m| m.status == MessageStatus::Sent)
            .collect();
        let last_user = confirmed.iter().rposition(|m| m.role == MessageRole::User)?;
        Some(confirmed[..=last_user].iter().map(Message::draft).collect())
    }

    async fn persist_reply(
        &self,
        conversation_id: &str,
        temp_id: &str,
        options: &RetryOptions,
    ) -> Result<Message, ChatError> {
        let pending = self
            .store
            .find_unconfirmed(conversation_id, temp_id)
            .ok_or_else(|| StoreError::MessageNotFound(temp_id.to_string()))?;
        let draft = pending.draft();
        let api = &self.services.api;

        match with_retry(|| api.post_message(conversation_id, &draft), options).await {
            Ok(server_message) => {
                let message = Message::from(server_message.clone());
                self.store
                    .confirm_message(conversation_id, temp_id, server_message)?;
                Ok(message)
            }
            Err(RetryError::Rejected(e)) => {
                self.store.mark_message_failed(conversation_id, temp_id)?;
                self.notify(conversation_id, format!("Reply not saved: {e}"), false);
                Err(ChatError::Reply(RetryError::Rejected(e)))
            }
            Err(error) => {
                // Stays pending; the next flush delivers it
                self.queue.enqueue(conversation_id, pending.clone())?;
                self.notify(
                    conversation_id,
                    format!("Reply kept locally until it can be saved: {error}"),
                    false,
                );
                Ok(pending)
            }
        }
    }

    // ==================== Tool calls ====================

    fn gate(&self, conversation_id: &str) -> ToolCallGate {
        lock(&self.gates)
            .entry(conversation_id.to_string())
            .or_default()
            .clone()
    }

    fn propose_tool(&self, conversation_id: &str, request: ToolCallRequest) -> Option<ToolCall> {
        let tool_name = request.tool_name.clone();
        match self.gate(conversation_id).propose(request) {
            Ok(call) => {
                let _ = self.events.send(ChatEvent::ToolCallProposed {
                    conversation_id: conversation_id.to_string(),
                    call: call.clone(),
                });
                Some(call)
            }
            Err(e) => {
                let _ = self.events.send(ChatEvent::ToolCallRejected {
                    conversation_id: conversation_id.to_string(),
                    tool_name,
                    reason: e.to_string(),
                });
                None
            }
        }
    }

    /// The current conversation's unresolved tool call
    pub fn pending_tool_call(&self) -> Option<ToolCall> {
        self.gate(&self.conversation_id()).current()
    }

    /// Approve and run the pending tool call. A failing action is reported
    /// on the returned call and does not end the conversation.
    pub async fn confirm_tool(&self) -> Result<ToolCall, ChatError> {
        let conversation_id = self.conversation_id();
        let gate = self.gate(&conversation_id);

        let call = gate.confirm()?;
        self.tool_updated(&conversation_id, &call);

        let call = gate.execute(Arc::clone(&self.services.tools)).await?;
        self.tool_updated(&conversation_id, &call);
        if call.state == ToolCallState::Failed {
            let reason = call.error.as_deref().unwrap_or("unknown error");
            self.notify(
                &conversation_id,
                format!("{} failed: {reason}", call.tool_name),
                false,
            );
        }
        Ok(call)
    }

    /// Deny the pending tool call; denying twice is a no-op
    pub fn deny_tool(&self) -> Result<Option<ToolCall>, ChatError> {
        let conversation_id = self.conversation_id();
        let denied = self.gate(&conversation_id).deny()?;
        if let Some(call) = &denied {
            self.tool_updated(&conversation_id, call);
        }
        Ok(denied)
    }

    fn tool_updated(&self, conversation_id: &str, call: &ToolCall) {
        let _ = self.events.send(ChatEvent::ToolCallUpdated {
            conversation_id: conversation_id.to_string(),
            call: call.clone(),
        });
    }

    // ==================== Conversations ====================

    /// Switch conversations: stops running exchanges, clears the target's
    /// cache, re-shows its queued messages and loads its newest page.
    pub async fn switch_conversation(&self, conversation_id: &str) -> Result<(), ChatError> {
        self.stop();
        let previous = std::mem::replace(
            &mut *lock(&self.conversation_id),
            conversation_id.to_string(),
        );
        tracing::info!(from = %previous, to = %conversation_id, "Switching conversation");

        lock(&self.gates).retain(|id, gate| id == conversation_id || gate.is_busy());

        self.pagination.clear(conversation_id);
        for entry in self.queue.get_queued_messages(Some(conversation_id)) {
            let mut message = entry.message;
            if entry.held {
                message.status = MessageStatus::Failed;
            }
            self.store.restore_message(conversation_id, message)?;
        }

        if self.queue.is_online() {
            self.pagination.load_initial(conversation_id).await?;
        }
        Ok(())
    }

    /// Load the current conversation's newest page
    pub async fn load_initial(&self) -> Result<(), ChatError> {
        Ok(self.pagination.load_initial(&self.conversation_id()).await?)
    }

    /// Load older history for the current conversation
    pub async fn load_more(&self) -> Result<LoadMore, ChatError> {
        Ok(self.pagination.load_more(&self.conversation_id()).await?)
    }

    // ==================== Helpers ====================

    fn exchange_token(&self) -> CancellationToken {
        lock(&self.stop).child_token()
    }

    fn retry_options(&self, conversation_id: &str, token: &CancellationToken) -> RetryOptions {
        let events = self.events.clone();
        let conversation_id = conversation_id.to_string();
        self.retry
            .clone()
            .with_cancellation(token.clone())
            .with_on_retry(move |attempt| {
                let _ = events.send(ChatEvent::RetryScheduled {
                    conversation_id: conversation_id.clone(),
                    attempt: attempt.clone(),
                });
            })
    }

    fn notify(&self, conversation_id: &str, message: String, retryable: bool) {
        tracing::warn!(conv_id = %conversation_id, retryable, "{message}");
        let _ = self.events.send(ChatEvent::Notification {
            conversation_id: conversation_id.to_string(),
            message,
            retryable,
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
