//! Shared counter store trait and implementations.
//!
//! The store is logically owned by no single process: several service
//! instances increment the same counters. Every read-modify-write sequence
//! therefore runs as one atomic unit inside the store, expressed as a
//! [`Script`].

mod entry;
#[cfg(feature = "memory")]
mod memory_gc;
#[cfg(feature = "redis")]
mod redis_store;

pub use entry::StorageEntry;

#[cfg(feature = "memory")]
pub use memory_gc::{GcConfig, GcInterval, MemoryStorage};

#[cfg(feature = "redis")]
pub use redis_store::{RedisConfig, RedisStorage};

use std::future::Future;
use std::time::Duration;

use crate::error::{Result, StorageError};

/// Reply of an atomic [`Script`]: `(allowed, countOrTokens, resetOrRetryMs)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptReply {
    /// Whether the script admitted the request.
    pub allowed: bool,
    /// Count or whole tokens, depending on the algorithm.
    pub value: u64,
    /// Reset or retry-after time in milliseconds.
    pub reset_ms: u64,
}

impl ScriptReply {
    /// Decode the raw integer tuple a server-side script returns.
    pub fn from_raw(raw: &[i64]) -> std::result::Result<Self, StorageError> {
        match raw {
            [allowed @ (0 | 1), value, reset] if *value >= 0 && *reset >= 0 => Ok(Self {
                allowed: *allowed == 1,
                value: *value as u64,
                reset_ms: *reset as u64,
            }),
            other => Err(StorageError::MalformedReply(format!("{other:?}"))),
        }
    }
}

/// An atomic read-modify-write sequence over one key.
///
/// A script exists in two forms that must agree: a Lua `source` for stores
/// with server-side scripting, and `apply`, the same transition over a
/// [`StorageEntry`], for in-process stores that hold a per-key lock.
///
/// Lua sources receive the key as `KEYS[1]` and `args(now)` as `ARGV`, and
/// return `{allowed, value, reset_ms}`.
pub trait Script: Send + Sync {
    /// Lua source executed by server-side stores.
    fn source(&self) -> &'static str;

    /// Numeric arguments, in `ARGV` order.
    fn args(&self, now: u64) -> Vec<String>;

    /// Expiry applied to the key after every run.
    fn ttl(&self) -> Duration;

    /// In-process equivalent of `source`.
    fn apply(&self, current: Option<StorageEntry>, now: u64) -> (StorageEntry, ScriptReply);
}

/// Storage backend trait for rate limiting state.
///
/// All storage operations are async to support both local and distributed backends.
/// Implementations must be thread-safe (`Send + Sync`).
///
/// Any `Err` returned here is a backend failure and is counted by the
/// circuit breaker; implementations must not swallow or retry them.
pub trait Storage: Send + Sync + 'static {
    /// Atomically increment a plain counter and return the new value.
    ///
    /// The expiry is set only when the counter is created (post-increment value 1).
    fn increment(&self, key: &str, ttl: Duration) -> impl Future<Output = Result<u64>> + Send;

    /// Read a plain counter without modifying it.
    fn counter(&self, key: &str) -> impl Future<Output = Result<Option<u64>>> + Send;

    /// Read algorithm state stored as a hash.
    ///
    /// Returns `None` if the key doesn't exist or has expired.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<StorageEntry>>> + Send;

    /// Delete a key.
    ///
    /// Returns success even if the key didn't exist.
    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Run `script` against `key` as one atomic unit.
    fn execute_atomic<S: Script>(
        &self,
        key: &str,
        script: &S,
        now: u64,
    ) -> impl Future<Output = Result<ScriptReply>> + Send;
}

impl<S: Storage + ?Sized> Storage for std::sync::Arc<S> {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64> {
        (**self).increment(key, ttl).await
    }

    async fn counter(&self, key: &str) -> Result<Option<u64>> {
        (**self).counter(key).await
    }

    async fn get(&self, key: &str) -> Result<Option<StorageEntry>> {
        (**self).get(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key).await
    }

    async fn execute_atomic<Sc: Script>(&self, key: &str, script: &Sc, now: u64) -> Result<ScriptReply> {
        (**self).execute_atomic(key, script, now).await
    }
}

impl<S: Storage + ?Sized> Storage for Box<S> {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64> {
        (**self).increment(key, ttl).await
    }

    async fn counter(&self, key: &str) -> Result<Option<u64>> {
        (**self).counter(key).await
    }

    async fn get(&self, key: &str) -> Result<Option<StorageEntry>> {
        (**self).get(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key).await
    }

    async fn execute_atomic<Sc: Script>(&self, key: &str, script: &Sc, now: u64) -> Result<ScriptReply> {
        (**self).execute_atomic(key, script, now).await
    }
}
