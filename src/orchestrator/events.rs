//! Events broadcast to the UI layer

use crate::retry::RetryAttempt;
use crate::tool_gate::ToolCall;

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// The conversation's message list changed
    MessagesChanged { conversation_id: String },
    /// Streamed assistant text, appended to the pending reply `temp_id`
    AssistantDelta {
        conversation_id: String,
        temp_id: String,
        delta: String,
    },
    /// A failed attempt will be retried after `attempt.next_delay`
    RetryScheduled {
        conversation_id: String,
        attempt: RetryAttempt,
    },
    /// Dismissible notice; `retryable` offers a manual retry
    Notification {
        conversation_id: String,
        message: String,
        retryable: bool,
    },
    ToolCallProposed {
        conversation_id: String,
        call: ToolCall,
    },
    ToolCallUpdated {
        conversation_id: String,
        call: ToolCall,
    },
    /// Proposal refused because another call is unresolved
    ToolCallRejected {
        conversation_id: String,
        tool_name: String,
        reason: String,
    },
    ConnectivityChanged { online: bool },
}

impl ChatEvent {
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            ChatEvent::MessagesChanged { conversation_id }
            | ChatEvent::AssistantDelta {
                conversation_id, ..
            }
            | ChatEvent::RetryScheduled {
                conversation_id, ..
            }
            | ChatEvent::Notification {
                conversation_id, ..
            }
            | ChatEvent::ToolCallProposed {
                conversation_id, ..
            }
            | ChatEvent::ToolCallUpdated {
                conversation_id, ..
            }
            | ChatEvent::ToolCallRejected {
                conversation_id, ..
            } => Some(conversation_id),
            ChatEvent::ConnectivityChanged { .. } => None,
        }
    }
}
