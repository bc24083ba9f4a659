//! Mock collaborators for testing
//!
//! Scripted results are consumed in order; when a script runs dry the mock
//! falls back to a benign default.

use crate::error::DeliveryError;
use crate::message::{MessageDraft, ServerMessage};
use crate::persistence::{KeyValueStore, MemoryStore, PersistenceError, PersistenceResult};
use crate::transport::{
    ChunkStream, CompletionChunk, CompletionRequest, CompletionService, MessageApi, MessagePage,
    ToolExecutor,
};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

// ============================================================================
// Flaky Key-Value Store
// ============================================================================

/// In-memory store whose writes can be made to fail
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    failing: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> PersistenceResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistenceError::Io(std::io::Error::other("disk full")));
        }
        Ok(())
    }
}

impl KeyValueStore for FlakyStore {
    fn get(&self, key: &str) -> PersistenceResult<Option<String>> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> PersistenceResult<()> {
        self.check()?;
        self.inner.set(key, value)
    }

    fn delete(&self, key: &str) -> PersistenceResult<()> {
        self.check()?;
        self.inner.delete(key)
    }
}

// ============================================================================
// Mock Message API
// ============================================================================

#[derive(Default)]
pub struct MockMessageApi {
    post_errors: Mutex<VecDeque<DeliveryError>>,
    failing: Mutex<Option<DeliveryError>>,
    pages: Mutex<VecDeque<Result<MessagePage, DeliveryError>>>,
    delay: Mutex<Option<Duration>>,
    next_id: AtomicU32,
    /// Every post attempt, successful or not
    pub attempts: Mutex<Vec<(String, MessageDraft)>>,
    /// Posts the server accepted
    pub posted: Mutex<Vec<(String, ServerMessage)>>,
    /// `(conversation_id, cursor, limit)` per list call
    pub list_calls: Mutex<Vec<(String, Option<String>, usize)>>,
}

#[allow(dead_code)]
impl MockMessageApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next post with `error`
    pub fn queue_post_error(&self, error: DeliveryError) {
        self.post_errors.lock().unwrap().push_back(error);
    }

    /// Fail every post until `recover` is called
    pub fn fail_all_posts(&self, error: DeliveryError) {
        *self.failing.lock().unwrap() = Some(error);
    }

    pub fn recover(&self) {
        *self.failing.lock().unwrap() = None;
    }

    pub fn queue_page(&self, page: MessagePage) {
        self.pages.lock().unwrap().push_back(Ok(page));
    }

    pub fn queue_page_error(&self, error: DeliveryError) {
        self.pages.lock().unwrap().push_back(Err(error));
    }

    /// Every call sleeps this long first
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn posted_contents(&self) -> Vec<String> {
        self.posted
            .lock()
            .unwrap()
            .iter()
            .map(|(_, message)| message.content.clone())
            .collect()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    pub fn list_call_count(&self) -> usize {
        self.list_calls.lock().unwrap().len()
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl MessageApi for MockMessageApi {
    async fn post_message(
        &self,
        conversation_id: &str,
        draft: &MessageDraft,
    ) -> Result<ServerMessage, DeliveryError> {
        self.attempts
            .lock()
            .unwrap()
            .push((conversation_id.to_string(), draft.clone()));
        self.pause().await;

        if let Some(error) = self.post_errors.lock().unwrap().pop_front() {
            return Err(error);
        }
        if let Some(error) = self.failing.lock().unwrap().clone() {
            return Err(error);
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let message = ServerMessage {
            id: format!("srv-{n}"),
            role: draft.role,
            content: draft.content.clone(),
            created_at: Utc::now(),
        };
        self.posted
            .lock()
            .unwrap()
            .push((conversation_id.to_string(), message.clone()));
        Ok(message)
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<MessagePage, DeliveryError> {
        self.list_calls.lock().unwrap().push((
            conversation_id.to_string(),
            cursor.map(String::from),
            limit,
        ));
        self.pause().await;

        self.pages.lock().unwrap().pop_front().unwrap_or_else(|| {
            Ok(MessagePage {
                messages: Vec::new(),
                has_more: false,
                next_cursor: None,
            })
        })
    }
}

// ============================================================================
// Mock Completion Service
// ============================================================================

struct Exchange {
    items: Vec<Result<CompletionChunk, DeliveryError>>,
    /// Keep the stream open after the scripted items
    hang: bool,
}

#[derive(Default)]
pub struct MockCompletionService {
    exchanges: Mutex<VecDeque<Exchange>>,
    pub requests: Mutex<Vec<CompletionRequest>>,
}

#[allow(dead_code)]
impl MockCompletionService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_exchange(&self, items: Vec<Result<CompletionChunk, DeliveryError>>) {
        self.exchanges
            .lock()
            .unwrap()
            .push_back(Exchange { items, hang: false });
    }

    /// Queue an exchange whose stream never ends on its own
    pub fn queue_hanging_exchange(&self, items: Vec<Result<CompletionChunk, DeliveryError>>) {
        self.exchanges
            .lock()
            .unwrap()
            .push_back(Exchange { items, hang: true });
    }

    pub fn queue_text(&self, parts: &[&str]) {
        self.queue_exchange(
            parts
                .iter()
                .map(|p| Ok(CompletionChunk::Text((*p).to_string())))
                .collect(),
        );
    }

    pub fn recorded_requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl CompletionService for MockCompletionService {
    fn stream(&self, request: CompletionRequest) -> ChunkStream {
        self.requests.lock().unwrap().push(request);
        let exchange = self.exchanges.lock().unwrap().pop_front();

        match exchange {
            Some(Exchange { items, hang: true }) => {
                stream::iter(items).chain(stream::pending()).boxed()
            }
            Some(Exchange { items, hang: false }) => stream::iter(items).boxed(),
            None => stream::empty().boxed(),
        }
    }
}

// ============================================================================
// Mock Tool Executor
// ============================================================================

#[derive(Default)]
pub struct MockToolExecutor {
    results: Mutex<VecDeque<Result<Value, DeliveryError>>>,
    pub executions: Mutex<Vec<(String, Value)>>,
}

#[allow(dead_code)]
impl MockToolExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_result(&self, result: Result<Value, DeliveryError>) {
        self.results.lock().unwrap().push_back(result);
    }

    pub fn clear_results(&self) {
        self.results.lock().unwrap().clear();
    }

    pub fn recorded_executions(&self) -> Vec<(String, Value)> {
        self.executions.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolExecutor for MockToolExecutor {
    async fn execute(&self, tool_name: &str, args: &Value) -> Result<Value, DeliveryError> {
        self.executions
            .lock()
            .unwrap()
            .push((tool_name.to_string(), args.clone()));
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(serde_json::json!({ "ok": true })))
    }
}
