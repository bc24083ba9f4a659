//! Notechat - resilient message delivery for an AI note-taking chat
//!
//! Optimistic sends, bounded retries, a durable offline queue, cursor
//! pagination and user-confirmed tool calls around one streaming completion
//! exchange per turn.

#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::module_name_repetitions
)]

pub mod config;
pub mod error;
pub mod message;
pub mod message_store;
pub mod offline_queue;
pub mod orchestrator;
pub mod pagination;
pub mod persistence;
pub mod retry;
pub mod tool_gate;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::ChatConfig;
pub use error::{DeliveryError, ErrorKind};
pub use message::{Message, MessageId, MessageRole, MessageStatus};
pub use message_store::MessageStore;
pub use offline_queue::OfflineQueue;
pub use orchestrator::{ChatError, ChatEvent, ChatOrchestrator, ChatServices, OrchestratorOptions};
pub use retry::{with_retry, with_streaming_retry, RetryError, RetryOptions};
