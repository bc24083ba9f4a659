//! External collaborators
//!
//! The message persistence API, the streaming completion service and the
//! tool action executor. Concrete HTTP implementations live in `http`.

mod http;

pub use http::{decode_chunk_stream, HttpCompletionService, HttpMessageApi, HttpToolExecutor};

use crate::error::DeliveryError;
use crate::message::{MessageDraft, ServerMessage};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// One page of history, oldest message first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<ServerMessage>,
    pub has_more: bool,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Message persistence API
#[async_trait]
pub trait MessageApi: Send + Sync {
    /// Persist a message; the response carries the server-assigned id
    async fn post_message(
        &self,
        conversation_id: &str,
        draft: &MessageDraft,
    ) -> Result<ServerMessage, DeliveryError>;

    /// Fetch the page ending just before `cursor` (newest page when `None`)
    async fn list_messages(
        &self,
        conversation_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<MessagePage, DeliveryError>;
}

/// Completion request: ordered history plus contextual metadata
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    pub conversation_id: String,
    pub messages: Vec<MessageDraft>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

/// Action requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
}

/// Incrementally delivered completion output
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionChunk {
    Text(String),
    ToolCall(ToolCallRequest),
}

pub type ChunkStream = BoxStream<'static, Result<CompletionChunk, DeliveryError>>;

/// Streaming completion service
pub trait CompletionService: Send + Sync {
    /// Start one exchange. Connection failures surface as the first item.
    fn stream(&self, request: CompletionRequest) -> ChunkStream;
}

/// Executes confirmed tool calls
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, tool_name: &str, args: &Value) -> Result<Value, DeliveryError>;
}

/// Logging wrapper for the message API
pub struct LoggingMessageApi {
    inner: Arc<dyn MessageApi>,
}

impl LoggingMessageApi {
    pub fn new(inner: Arc<dyn MessageApi>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl MessageApi for LoggingMessageApi {
    async fn post_message(
        &self,
        conversation_id: &str,
        draft: &MessageDraft,
    ) -> Result<ServerMessage, DeliveryError> {
        let start = std::time::Instant::now();
        let result = self.inner.post_message(conversation_id, draft).await;
        let duration = start.elapsed();

        match &result {
            Ok(message) => {
                tracing::info!(
                    conv_id = %conversation_id,
                    message_id = %message.id,
                    duration_ms = %duration.as_millis(),
                    "Message persisted"
                );
            }
            Err(e) => {
                tracing::error!(
                    conv_id = %conversation_id,
                    duration_ms = %duration.as_millis(),
                    error = %e.message,
                    retryable = e.is_retryable(),
                    "Message persist failed"
                );
            }
        }

        result
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<MessagePage, DeliveryError> {
        let start = std::time::Instant::now();
        let result = self.inner.list_messages(conversation_id, cursor, limit).await;
        let duration = start.elapsed();

        match &result {
            Ok(page) => {
                tracing::info!(
                    conv_id = %conversation_id,
                    cursor = ?cursor,
                    count = page.messages.len(),
                    has_more = page.has_more,
                    duration_ms = %duration.as_millis(),
                    "Message page fetched"
                );
            }
            Err(e) => {
                tracing::error!(
                    conv_id = %conversation_id,
                    cursor = ?cursor,
                    duration_ms = %duration.as_millis(),
                    error = %e.message,
                    retryable = e.is_retryable(),
                    "Message page fetch failed"
                );
            }
        }

        result
    }
}
