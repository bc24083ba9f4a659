//! Cursor-based backward loading of conversation history

use crate::error::DeliveryError;
use crate::message_store::{MessageStore, StoreError};
use crate::transport::MessageApi;
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PaginationError {
    #[error(transparent)]
    Fetch(#[from] DeliveryError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of `load_more`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMore {
    /// Older messages were prepended
    Loaded { added: usize, has_more: bool },
    /// Nothing older, or a fetch is already in flight; no network call made
    Skipped,
}

pub struct PaginationController {
    api: Arc<dyn MessageApi>,
    store: MessageStore,
    page_size: usize,
}

impl PaginationController {
    pub fn new(api: Arc<dyn MessageApi>, store: MessageStore, page_size: usize) -> Self {
        Self {
            api,
            store,
            page_size: page_size.max(1),
        }
    }

    /// Fetch the newest window and replace the conversation's list.
    /// Unconfirmed local messages are kept.
    pub async fn load_initial(&self, conversation_id: &str) -> Result<(), PaginationError> {
        let page = self
            .api
            .list_messages(conversation_id, None, self.page_size)
            .await?;

        tracing::debug!(
            conv_id = %conversation_id,
            count = page.messages.len(),
            has_more = page.has_more,
            "Initial page loaded"
        );
        self.store.replace_page(conversation_id, page)?;
        Ok(())
    }

    /// Fetch the next older page and prepend it
    pub async fn load_more(&self, conversation_id: &str) -> Result<LoadMore, PaginationError> {
        let Some(cursor) = self.store.begin_load_more(conversation_id) else {
            return Ok(LoadMore::Skipped);
        };

        let page = match self
            .api
            .list_messages(conversation_id, Some(&cursor), self.page_size)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                self.store.abort_load_more(conversation_id);
                return Err(e.into());
            }
        };

        let added = self.store.prepend_page(conversation_id, &cursor, page)?;
        let has_more = self
            .store
            .conversation(conversation_id)
            .is_some_and(|cache| cache.has_more);

        tracing::debug!(conv_id = %conversation_id, cursor = %cursor, added, has_more, "Older page loaded");
        Ok(LoadMore::Loaded { added, has_more })
    }

    /// Reset cursor, `has_more` and the list together
    pub fn clear(&self, conversation_id: &str) {
        self.store.clear_conversation(conversation_id);
    }
}
