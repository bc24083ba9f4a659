//! Chat message types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// Delivery status of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Failed,
}

/// Identity of a message.
///
/// Optimistic messages carry a client-generated temporary id until the server
/// assigns one; keeping the two apart in the type stops state-machine code
/// from ever matching a temporary id against a server id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum MessageId {
    Pending(String),
    Confirmed(String),
}

impl MessageId {
    pub fn new_pending() -> Self {
        MessageId::Pending(uuid::Uuid::new_v4().to_string())
    }

    pub fn temp_id(&self) -> Option<&str> {
        match self {
            MessageId::Pending(id) => Some(id),
            MessageId::Confirmed(_) => None,
        }
    }

    pub fn server_id(&self) -> Option<&str> {
        match self {
            MessageId::Pending(_) => None,
            MessageId::Confirmed(id) => Some(id),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MessageId::Pending(id) | MessageId::Confirmed(id) => id,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Pending(id) => write!(f, "pending:{id}"),
            MessageId::Confirmed(id) => write!(f, "{id}"),
        }
    }
}

/// A message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
}

impl Message {
    /// Create an optimistic message with a fresh temporary id
    pub fn optimistic(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new_pending(),
            role,
            content: content.into(),
            created_at: Utc::now(),
            status: MessageStatus::Pending,
        }
    }

    pub fn temp_id(&self) -> Option<&str> {
        self.id.temp_id()
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self.id, MessageId::Confirmed(_))
    }

    /// The body sent to the message API for this message
    pub fn draft(&self) -> MessageDraft {
        MessageDraft {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

/// Message body as submitted to the persistence API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDraft {
    pub role: MessageRole,
    pub content: String,
}

/// Message as returned by the persistence API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl From<ServerMessage> for Message {
    fn from(msg: ServerMessage) -> Self {
        Self {
            id: MessageId::Confirmed(msg.id),
            role: msg.role,
            content: msg.content,
            created_at: msg.created_at,
            status: MessageStatus::Sent,
        }
    }
}
