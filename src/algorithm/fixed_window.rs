//! Fixed Window rate limiting algorithm.

use std::sync::Arc;
use std::time::Duration;

use crate::algorithm::{Algorithm, millis};
use crate::clock::{self, Clock};
use crate::decision::RateLimitResult;
use crate::error::Result;
use crate::storage::Storage;

/// Fixed Window rate limiting algorithm.
///
/// Counts requests in calendar-aligned buckets: window index is
/// `floor(now / window)`, so every instance agrees on the boundaries. The
/// counter is incremented even when over limit, so it may exceed the limit;
/// `remaining` is clamped to zero.
#[derive(Debug, Clone)]
pub struct FixedWindow {
    window_ms: u64,
    max_requests: u64,
    clock: Arc<dyn Clock>,
}

impl FixedWindow {
    /// Create a new Fixed Window algorithm instance.
    pub fn new(window: Duration, max_requests: u64) -> Self {
        Self {
            window_ms: millis(window).max(1),
            max_requests,
            clock: clock::system(),
        }
    }

    /// Read time from `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn key(identity: &str, window_index: u64) -> String {
        format!("rate:{identity}:{window_index}")
    }

    /// Count a request for `identity` against `limit`.
    pub async fn check<S: Storage>(
        &self,
        storage: &S,
        identity: &str,
        limit: u64,
    ) -> Result<RateLimitResult> {
        let now = self.clock.now_millis();
        let window_index = now / self.window_ms;
        let reset_ms = self.window_ms - now % self.window_ms;

        let count = storage
            .increment(&Self::key(identity, window_index), Duration::from_millis(self.window_ms))
            .await?;

        let remaining = limit.saturating_sub(count);
        Ok(RateLimitResult::new(count <= limit, limit, remaining, reset_ms))
    }
}

impl Algorithm for FixedWindow {
    fn name(&self) -> &'static str {
        "fixed-window"
    }

    fn default_limit(&self) -> u64 {
        self.max_requests
    }

    async fn check_and_record<S: Storage>(
        &self,
        storage: &S,
        identity: &str,
        limit: u64,
    ) -> Result<RateLimitResult> {
        self.check(storage, identity, limit).await
    }

    async fn status<S: Storage>(
        &self,
        storage: &S,
        identity: &str,
        limit: u64,
    ) -> Result<RateLimitResult> {
        let now = self.clock.now_millis();
        let window_index = now / self.window_ms;
        let reset_ms = self.window_ms - now % self.window_ms;

        let count = storage
            .counter(&Self::key(identity, window_index))
            .await?
            .unwrap_or(0);

        Ok(RateLimitResult::new(
            count < limit,
            limit,
            limit.saturating_sub(count),
            reset_ms,
        ))
    }

    async fn reset<S: Storage>(&self, storage: &S, identity: &str) -> Result<()> {
        let window_index = self.clock.now_millis() / self.window_ms;
        storage.delete(&Self::key(identity, window_index)).await
    }
}
