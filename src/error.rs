//! Delivery error types

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Delivery error with classification
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct DeliveryError {
    pub kind: ErrorKind,
    pub message: String,
    /// HTTP status (or equivalent) that produced this error, if any
    pub status: Option<u16>,
    pub retry_after: Option<Duration>,
}

impl DeliveryError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, duration: Duration) -> Self {
        self.retry_after = Some(duration);
        self
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ErrorKind::Network,
            format!("Timed out after {}ms", after.as_millis()),
        )
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Server, message)
    }

    pub fn client(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Client, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimit, message)
    }

    pub fn tool_execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ToolExecution, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    /// A stream failed after `delivered` chunks already reached the consumer.
    pub fn partial_stream(delivered: usize, cause: &DeliveryError) -> Self {
        Self {
            kind: ErrorKind::PartialStream,
            message: format!("Stream failed after {delivered} chunks: {}", cause.message),
            status: cause.status,
            retry_after: None,
        }
    }

    /// Classify a non-success HTTP response.
    pub fn from_status(status: u16, body: &str) -> Self {
        let err = match status {
            408 => Self::network(format!("Request timeout: {body}")),
            429 => Self::rate_limit(format!("Rate limited: {body}")),
            401 | 403 => Self::client(format!("Authentication failed: {body}")),
            400..=499 => Self::client(format!("Request rejected: {body}")),
            500..=599 => Self::server(format!("Server error: {body}")),
            _ => Self::unknown(format!("HTTP {status}: {body}")),
        };
        err.with_status(status)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::network(format!("Request timeout: {e}"))
        } else if e.is_connect() {
            Self::network(format!("Connection failed: {e}"))
        } else if let Some(status) = e.status() {
            Self::from_status(status.as_u16(), &e.to_string())
        } else if e.is_decode() || e.is_body() {
            Self::network(format!("Failed to read response: {e}"))
        } else {
            Self::unknown(format!("Request failed: {e}"))
        }
    }
}

/// Error classification for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unreachable host, dropped connection, timeout - retryable
    Network,
    /// 5xx - retryable
    Server,
    /// 4xx (auth, validation) - surfaced immediately
    Client,
    /// 429 - retryable, the UI shows a countdown
    RateLimit,
    /// Output was already delivered; only a manual retry of the turn helps
    PartialStream,
    /// Scoped to one tool call, never ends the conversation
    ToolExecution,
    Unknown,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Network | Self::Server | Self::RateLimit)
    }
}
