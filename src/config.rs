//! Runtime configuration from the environment

use crate::message_store::DEFAULT_CACHE_CAPACITY;
use crate::pagination::DEFAULT_PAGE_SIZE;
use crate::retry::{
    RetryOptions, DEFAULT_BACKOFF_FACTOR, DEFAULT_INITIAL_DELAY, DEFAULT_MAX_DELAY,
    DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT,
};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:3000/api";
pub const DEFAULT_CONVERSATION: &str = "default";
pub const DEFAULT_PERSIST_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq)]
pub struct ChatConfig {
    /// Base URL of the message, completion and tool endpoints
    pub api_url: String,
    pub db_path: String,
    pub conversation_id: String,
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub timeout: Duration,
    pub page_size: usize,
    pub cache_capacity: usize,
    pub persist_debounce: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            db_path: default_db_path(std::env::var("HOME").ok()),
            conversation_id: DEFAULT_CONVERSATION.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            timeout: DEFAULT_TIMEOUT,
            page_size: DEFAULT_PAGE_SIZE,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            persist_debounce: DEFAULT_PERSIST_DEBOUNCE,
        }
    }
}

fn default_db_path(home: Option<String>) -> String {
    let home = home.unwrap_or_else(|| "/tmp".to_string());
    format!("{home}/.notechat/notechat.db")
}

impl ChatConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source; unset or invalid values keep
    /// their defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self {
            db_path: default_db_path(lookup("HOME")),
            ..Self::default()
        };

        let millis = |key: &str, default: Duration| {
            parse(&lookup, key, default.as_millis())
                .map_or(default, |ms: u64| Duration::from_millis(ms))
        };

        let factor: Option<f64> =
            parse(&lookup, "NOTECHAT_BACKOFF_FACTOR", defaults.backoff_factor);
        let backoff_factor = match factor {
            Some(f) if f.is_finite() && f >= 1.0 => f,
            Some(f) => {
                tracing::warn!(value = f, "NOTECHAT_BACKOFF_FACTOR below 1.0, using default");
                defaults.backoff_factor
            }
            None => defaults.backoff_factor,
        };

        Self {
            api_url: lookup("NOTECHAT_API_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.api_url),
            db_path: lookup("NOTECHAT_DB_PATH").unwrap_or(defaults.db_path),
            conversation_id: lookup("NOTECHAT_CONVERSATION").unwrap_or(defaults.conversation_id),
            max_retries: parse(&lookup, "NOTECHAT_MAX_RETRIES", defaults.max_retries)
                .unwrap_or(defaults.max_retries),
            initial_delay: millis("NOTECHAT_INITIAL_DELAY_MS", defaults.initial_delay),
            max_delay: millis("NOTECHAT_MAX_DELAY_MS", defaults.max_delay),
            backoff_factor,
            timeout: millis("NOTECHAT_TIMEOUT_MS", defaults.timeout),
            page_size: parse(&lookup, "NOTECHAT_PAGE_SIZE", defaults.page_size)
                .unwrap_or(defaults.page_size),
            cache_capacity: parse(&lookup, "NOTECHAT_CACHE_CAPACITY", defaults.cache_capacity)
                .unwrap_or(defaults.cache_capacity),
            persist_debounce: millis("NOTECHAT_PERSIST_DEBOUNCE_MS", defaults.persist_debounce),
        }
    }

    pub fn retry_options(&self) -> RetryOptions {
        RetryOptions::new(
            self.max_retries,
            self.initial_delay,
            self.max_delay,
            self.backoff_factor,
            self.timeout,
        )
    }
}

/// Parse `key` if set. Invalid values are logged and read as unset.
fn parse<T, D>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: D) -> Option<T>
where
    T: FromStr,
    D: std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, default = %default, "Invalid config value, using default");
            None
        }
    }
}
