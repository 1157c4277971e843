//! In-process fallback limiter.
//!
//! Backstops the shared store while the circuit is open. Counters live only
//! in this process, so N instances together may admit up to N times the
//! limit; a crude guardrail is preferred over failing open or failing closed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

use crate::clock::{self, Clock};
use crate::decision::RateLimitResult;

/// Fixed window length of the fallback limiter.
pub const FALLBACK_WINDOW: Duration = Duration::from_secs(60);

/// Limit applied by [`LocalRateLimiter::check`].
pub const DEFAULT_FALLBACK_LIMIT: u64 = 10;

#[derive(Debug, Clone, Copy)]
struct Counter {
    window_start: u64,
    count: u64,
}

/// Per-identity fixed-window counter kept in process memory.
///
/// Updates for one identity are serialized by the map's per-key lock, so
/// concurrent checks never lose an increment. Counters whose window has
/// passed are swept at most once per window, so identities seen only
/// during an outage do not pile up.
#[derive(Debug)]
pub struct LocalRateLimiter {
    counters: DashMap<String, Counter>,
    last_sweep: AtomicU64,
    window_ms: u64,
    default_limit: u64,
    clock: Arc<dyn Clock>,
}

impl Default for LocalRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_FALLBACK_LIMIT)
    }
}

impl LocalRateLimiter {
    /// Create a limiter whose [`check`](Self::check) applies `default_limit`.
    pub fn new(default_limit: u64) -> Self {
        Self {
            counters: DashMap::new(),
            last_sweep: AtomicU64::new(0),
            window_ms: FALLBACK_WINDOW.as_millis() as u64,
            default_limit,
            clock: clock::system(),
        }
    }

    /// Read time from `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Limit applied when none is given.
    pub fn default_limit(&self) -> u64 {
        self.default_limit
    }

    /// Count a request against the default limit.
    pub fn check(&self, identity: &str) -> RateLimitResult {
        self.check_with_limit(identity, self.default_limit)
    }

    /// Count a request for `identity` against `limit`.
    ///
    /// Denied requests are counted too.
    pub fn check_with_limit(&self, identity: &str, limit: u64) -> RateLimitResult {
        let now = self.clock.now_millis();
        self.maybe_sweep(now);

        let mut counter = self
            .counters
            .entry(identity.to_string())
            .or_insert(Counter {
                window_start: now,
                count: 0,
            });

        if now.saturating_sub(counter.window_start) >= self.window_ms {
            counter.window_start = now;
            counter.count = 0;
        }
        counter.count += 1;

        let count = counter.count;
        let elapsed = now.saturating_sub(counter.window_start);
        drop(counter);

        let allowed = count <= limit;
        if !allowed {
            tracing::debug!(identity, count, limit, "Local fallback limit exceeded");
        }

        RateLimitResult::new(
            allowed,
            limit,
            limit.saturating_sub(count),
            self.window_ms.saturating_sub(elapsed),
        )
    }

    /// Number of identities with a counter. Includes counters that expired
    /// since the last sweep.
    pub fn active_identities(&self) -> usize {
        self.counters.len()
    }

    /// Drop every counter whose window has passed.
    pub fn sweep(&self) {
        let now = self.clock.now_millis();
        self.last_sweep.store(now, Ordering::Relaxed);
        self.sweep_at(now);
    }

    fn sweep_at(&self, now: u64) {
        let window_ms = self.window_ms;
        self.counters
            .retain(|_, counter| now.saturating_sub(counter.window_start) < window_ms);
    }

    fn maybe_sweep(&self, now: u64) {
        let last = self.last_sweep.load(Ordering::Relaxed);
        if now.saturating_sub(last) < self.window_ms {
            return;
        }
        // One caller per window wins the sweep.
        if self
            .last_sweep
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            self.sweep_at(now);
        }
    }

    /// Drop the counter for `identity`.
    pub fn forget(&self, identity: &str) {
        self.counters.remove(identity);
    }

    /// Drop every counter.
    pub fn clear(&self) {
        self.counters.clear();
    }
}
