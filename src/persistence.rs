//! Durable key-value persistence
//!
//! Used by the offline queue (queued entries) and the message store (recent
//! conversations). Only single-key atomicity is assumed.

mod sqlite;

pub use sqlite::SqliteStore;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Get/set/delete by key
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> PersistenceResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> PersistenceResult<()>;

    fn delete(&self, key: &str) -> PersistenceResult<()>;
}

/// Typed helpers usable through `dyn KeyValueStore`
pub fn load_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> PersistenceResult<Option<T>> {
    store
        .get(key)?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(Into::into)
}

pub fn save_json<T: Serialize>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> PersistenceResult<()> {
    store.set(key, &serde_json::to_string(value)?)
}

/// In-process store; nothing survives a restart
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<_> = entries.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> PersistenceResult<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> PersistenceResult<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> PersistenceResult<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}
