//! Storage entry type for rate limiting state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Hash field names shared by every backend and by the Lua scripts.
pub mod fields {
    /// Current window count (sliding window) or plain counter value.
    pub const COUNT: &str = "count";
    /// Previous window count (sliding window).
    pub const PREV_COUNT: &str = "prev_count";
    /// Window start timestamp, Unix milliseconds (sliding window).
    pub const WINDOW_START: &str = "window_start";
    /// Available tokens (token bucket).
    pub const TOKENS: &str = "tokens";
    /// Last refill timestamp, Unix milliseconds (token bucket).
    pub const LAST_UPDATE: &str = "last_update";
}

/// Entry stored in the storage backend.
///
/// One struct covers the state of every algorithm; fields an algorithm does
/// not use stay at their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StorageEntry {
    /// Request count (current window).
    pub count: u64,

    /// Previous window count (for sliding window).
    pub prev_count: u64,

    /// Window start timestamp (Unix milliseconds).
    pub window_start: u64,

    /// Available tokens (for token bucket algorithm).
    pub tokens: Option<f64>,

    /// Last update timestamp (Unix milliseconds).
    pub last_update: u64,
}

impl StorageEntry {
    /// Create a new storage entry for window-based algorithms.
    pub fn new(count: u64, window_start: u64) -> Self {
        Self {
            count,
            window_start,
            last_update: window_start,
            ..Default::default()
        }
    }

    /// Create a storage entry for token bucket.
    pub fn with_tokens(tokens: f64, last_update: u64) -> Self {
        Self {
            tokens: Some(tokens),
            last_update,
            ..Default::default()
        }
    }

    /// Set previous window count.
    pub fn set_prev_count(mut self, count: u64) -> Self {
        self.prev_count = count;
        self
    }

    /// Decode an entry from a hash read.
    ///
    /// An empty hash means the key does not exist.
    pub fn from_fields(map: &HashMap<String, String>) -> Result<Option<Self>, StorageError> {
        if map.is_empty() {
            return Ok(None);
        }

        Ok(Some(Self {
            count: parse_field(map, fields::COUNT)?.unwrap_or(0),
            prev_count: parse_field(map, fields::PREV_COUNT)?.unwrap_or(0),
            window_start: parse_field(map, fields::WINDOW_START)?.unwrap_or(0),
            tokens: parse_field(map, fields::TOKENS)?,
            last_update: parse_field(map, fields::LAST_UPDATE)?.unwrap_or(0),
        }))
    }
}

fn parse_field<T: std::str::FromStr>(
    map: &HashMap<String, String>,
    name: &str,
) -> Result<Option<T>, StorageError> {
    map.get(name)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|_| StorageError::Serialization(format!("field `{name}` = {raw:?}")))
        })
        .transpose()
}
