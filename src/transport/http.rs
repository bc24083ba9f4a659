//! HTTP implementations of the transport traits

use super::{
    ChunkStream, CompletionChunk, CompletionRequest, CompletionService, MessageApi, MessagePage,
    ToolCallRequest, ToolExecutor,
};
use crate::error::DeliveryError;
use crate::message::{MessageDraft, ServerMessage};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

fn build_client(timeout: Option<Duration>) -> Result<Client, DeliveryError> {
    let mut builder = Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder
        .build()
        .map_err(|e| DeliveryError::unknown(format!("Failed to create HTTP client: {e}")))
}

fn retry_after_header(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Turn a non-success response into a classified error
async fn error_for_response(response: Response) -> DeliveryError {
    let status = response.status().as_u16();
    let retry_after = retry_after_header(&response);
    let body = response.text().await.unwrap_or_default();
    let err = DeliveryError::from_status(status, &body);
    match retry_after {
        Some(delay) => err.with_retry_after(delay),
        None => err,
    }
}

async fn read_json<T: for<'de> Deserialize<'de>>(response: Response) -> Result<T, DeliveryError> {
    if !response.status().is_success() {
        return Err(error_for_response(response).await);
    }
    let body = response.text().await?;
    serde_json::from_str(&body)
        .map_err(|e| DeliveryError::unknown(format!("Failed to parse response: {e} - body: {body}")))
}

// ============================================================================
// Message persistence API
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PostMessageBody<'a> {
    conversation_id: &'a str,
    message: &'a MessageDraft,
}

#[derive(Deserialize)]
struct PostMessageResponse {
    message: ServerMessage,
}

/// `POST /messages`, `GET /messages?conversationId&cursor&limit`
pub struct HttpMessageApi {
    client: Client,
    base_url: String,
}

impl HttpMessageApi {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DeliveryError> {
        Ok(Self {
            client: build_client(Some(timeout))?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl MessageApi for HttpMessageApi {
    async fn post_message(
        &self,
        conversation_id: &str,
        draft: &MessageDraft,
    ) -> Result<ServerMessage, DeliveryError> {
        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .json(&PostMessageBody {
                conversation_id,
                message: draft,
            })
            .send()
            .await?;

        let body: PostMessageResponse = read_json(response).await?;
        Ok(body.message)
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<MessagePage, DeliveryError> {
        let mut query = vec![
            ("conversationId", conversation_id.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }

        let response = self
            .client
            .get(format!("{}/messages", self.base_url))
            .query(&query)
            .send()
            .await?;

        read_json(response).await
    }
}

// ============================================================================
// Streaming completion service
// ============================================================================

/// Wire format of one stream line
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireChunk {
    Text {
        text: String,
    },
    ToolCall {
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(default)]
        args: Value,
    },
    #[serde(other)]
    Ignored,
}

/// `POST /chat`, answered with newline-delimited JSON chunks
pub struct HttpCompletionService {
    client: Client,
    base_url: String,
}

impl HttpCompletionService {
    /// No overall timeout: the retry engine bounds the wait for each chunk
    pub fn new(base_url: &str) -> Result<Self, DeliveryError> {
        Ok(Self {
            client: build_client(None)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

impl CompletionService for HttpCompletionService {
    fn stream(&self, request: CompletionRequest) -> ChunkStream {
        let pending = self
            .client
            .post(format!("{}/chat", self.base_url))
            .json(&request)
            .send();

        futures::stream::once(async move {
            let response = pending.await?;
            if !response.status().is_success() {
                return Err(error_for_response(response).await);
            }
            Ok(decode_chunk_stream(response.bytes_stream()))
        })
        .map(|opened| match opened {
            Ok(chunks) => chunks,
            Err(e) => futures::stream::once(async move { Err(e) }).boxed(),
        })
        .flatten()
        .boxed()
    }
}

fn parse_line(line: &[u8]) -> Result<Option<CompletionChunk>, DeliveryError> {
    let text = std::str::from_utf8(line)
        .map_err(|e| DeliveryError::unknown(format!("Invalid UTF-8 in stream: {e}")))?;
    let text = text.trim();
    // Tolerate SSE framing
    let text = text.strip_prefix("data:").map_or(text, str::trim_start);
    if text.is_empty() || text == "[DONE]" {
        return Ok(None);
    }

    let chunk: WireChunk = serde_json::from_str(text)
        .map_err(|e| DeliveryError::unknown(format!("Malformed stream chunk: {e}")))?;
    Ok(match chunk {
        WireChunk::Text { text } => Some(CompletionChunk::Text(text)),
        WireChunk::ToolCall { tool_name, args } => {
            Some(CompletionChunk::ToolCall(ToolCallRequest { tool_name, args }))
        }
        WireChunk::Ignored => None,
    })
}

/// Decode a byte stream of newline-delimited JSON into completion chunks.
///
/// Lines may be split anywhere across reads, including inside a multi-byte
/// character. A transport error ends the stream after being yielded.
pub fn decode_chunk_stream<S, B, E>(bytes: S) -> ChunkStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<DeliveryError> + Send + 'static,
{
    futures::stream::unfold(
        (Box::pin(bytes), Vec::<u8>::new(), false),
        |(mut bytes, mut buffer, mut finished)| async move {
            loop {
                if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    match parse_line(&line) {
                        Ok(Some(chunk)) => return Some((Ok(chunk), (bytes, buffer, finished))),
                        Ok(None) => continue,
                        Err(e) => return Some((Err(e), (bytes, buffer, finished))),
                    }
                }

                if finished {
                    if buffer.is_empty() {
                        return None;
                    }
                    let line = std::mem::take(&mut buffer);
                    return match parse_line(&line) {
                        Ok(Some(chunk)) => Some((Ok(chunk), (bytes, buffer, finished))),
                        Ok(None) => None,
                        Err(e) => Some((Err(e), (bytes, buffer, finished))),
                    };
                }

                match bytes.next().await {
                    Some(Ok(data)) => buffer.extend_from_slice(data.as_ref()),
                    Some(Err(e)) => {
                        buffer.clear();
                        return Some((Err(e.into()), (bytes, buffer, true)));
                    }
                    None => finished = true,
                }
            }
        },
    )
    .boxed()
}

// ============================================================================
// Tool action executor
// ============================================================================

/// `POST /tools/{toolName}` with the call's args as body
pub struct HttpToolExecutor {
    client: Client,
    base_url: String,
}

impl HttpToolExecutor {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DeliveryError> {
        Ok(Self {
            client: build_client(Some(timeout))?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ToolExecutor for HttpToolExecutor {
    async fn execute(&self, tool_name: &str, args: &Value) -> Result<Value, DeliveryError> {
        let response = self
            .client
            .post(format!("{}/tools/{tool_name}", self.base_url))
            .json(args)
            .send()
            .await?;

        read_json(response).await
    }
}
