//! Sliding Window Counter rate limiting algorithm.

use std::sync::Arc;
use std::time::Duration;

use crate::algorithm::Algorithm;
use crate::clock::{self, Clock};
use crate::decision::RateLimitResult;
use crate::error::Result;
use crate::storage::{Script, ScriptReply, Storage, StorageEntry};

// Mirrored by `apply` below for in-process stores; change both together.
// tests/redis_parity.rs compares them against a live server.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])

local state = redis.call('HMGET', key, 'count', 'prev_count', 'window_start')
local count = tonumber(state[1]) or 0
local prev_count = tonumber(state[2]) or 0
local window_start = tonumber(state[3])

if window_start == nil then
    count = 0
    prev_count = 0
    window_start = now
end

if now - window_start >= window then
    local slides = math.floor((now - window_start) / window)
    if slides == 1 then
        prev_count = count
    else
        prev_count = 0
    end
    count = 0
    window_start = window_start + slides * window
end

local elapsed = math.max(0, now - window_start)
local weighted = math.floor(prev_count * ((window - elapsed) / window) + count)

local allowed = 0
local reported = weighted
if weighted < limit then
    count = count + 1
    allowed = 1
    reported = weighted + 1
end

redis.call('HSET', key, 'count', count, 'prev_count', prev_count, 'window_start', window_start)
redis.call('PEXPIRE', key, window * 2)

return {allowed, reported, window - elapsed}
"#;

/// Weighted request estimate: the previous window's count scaled by how much
/// of it still overlaps the sliding window, plus the current count.
fn weighted_count(prev_count: u64, count: u64, elapsed_ms: u64, window_ms: u64) -> u64 {
    let overlap = window_ms.saturating_sub(elapsed_ms) as f64 / window_ms as f64;
    (prev_count as f64 * overlap + count as f64).floor() as u64
}

/// One slide-and-count step, run atomically by the store.
#[derive(Debug, Clone, Copy)]
struct CountScript {
    limit: u64,
    window_ms: u64,
}

impl Script for CountScript {
    fn source(&self) -> &'static str {
        SLIDING_WINDOW_SCRIPT
    }

    fn args(&self, now: u64) -> Vec<String> {
        vec![
            self.limit.to_string(),
            self.window_ms.to_string(),
            now.to_string(),
        ]
    }

    fn ttl(&self) -> Duration {
        Duration::from_millis(self.window_ms.saturating_mul(2))
    }

    fn apply(&self, current: Option<StorageEntry>, now: u64) -> (StorageEntry, ScriptReply) {
        let (mut count, mut prev_count, mut window_start) = match current {
            Some(e) => (e.count, e.prev_count, e.window_start),
            None => (0, 0, now),
        };

        let since_start = now.saturating_sub(window_start);
        if since_start >= self.window_ms {
            let slides = since_start / self.window_ms;
            prev_count = if slides == 1 { count } else { 0 };
            count = 0;
            window_start += slides * self.window_ms;
        }

        let elapsed = now.saturating_sub(window_start);
        let weighted = weighted_count(prev_count, count, elapsed, self.window_ms);

        let allowed = weighted < self.limit;
        let reported = if allowed {
            count += 1;
            weighted + 1
        } else {
            weighted
        };

        let entry = StorageEntry::new(count, window_start).set_prev_count(prev_count);
        let reply = ScriptReply {
            allowed,
            value: reported,
            reset_ms: self.window_ms.saturating_sub(elapsed),
        };
        (entry, reply)
    }
}

/// Sliding Window Counter rate limiting algorithm.
///
/// Approximates a true sliding window with two counters per identity. The
/// window start only moves forward in whole window lengths, so the weighted
/// count carries over smoothly when a window slides.
///
/// # Example
///
/// ```ignore
/// use resilient_ratelimit::algorithm::SlidingWindow;
///
/// let algorithm = SlidingWindow::new(60, 100);
/// let result = algorithm.check(&storage, "user:123", 100, 60).await?;
/// ```
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    window_seconds: u64,
    max_requests: u64,
    clock: Arc<dyn Clock>,
}

impl SlidingWindow {
    /// Create a new Sliding Window algorithm instance.
    pub fn new(window_seconds: u64, max_requests: u64) -> Self {
        Self {
            window_seconds: window_seconds.max(1),
            max_requests,
            clock: clock::system(),
        }
    }

    /// Read time from `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn key(identity: &str) -> String {
        format!("sliding:{identity}")
    }

    /// Count a request for `identity` against `limit` over a window of
    /// `window_seconds`.
    pub async fn check<S: Storage>(
        &self,
        storage: &S,
        identity: &str,
        limit: u64,
        window_seconds: u64,
    ) -> Result<RateLimitResult> {
        let script = CountScript {
            limit,
            window_ms: window_seconds.max(1).saturating_mul(1000),
        };
        let now = self.clock.now_millis();

        let reply = storage
            .execute_atomic(&Self::key(identity), &script, now)
            .await?;

        Ok(RateLimitResult::new(
            reply.allowed,
            limit,
            limit.saturating_sub(reply.value),
            reply.reset_ms,
        ))
    }

    /// Estimate from the last persisted counters without modifying them.
    ///
    /// No slide is performed, so right after a window boundary this can
    /// disagree with what the next [`check`](Self::check) reports.
    pub async fn peek<S: Storage>(
        &self,
        storage: &S,
        identity: &str,
        limit: u64,
        window_seconds: u64,
    ) -> Result<RateLimitResult> {
        let window_ms = window_seconds.max(1).saturating_mul(1000);
        let now = self.clock.now_millis();

        let Some(entry) = storage.get(&Self::key(identity)).await? else {
            return Ok(RateLimitResult::allowed(limit, limit, window_ms));
        };

        let elapsed = now.saturating_sub(entry.window_start);
        let weighted = weighted_count(entry.prev_count, entry.count, elapsed, window_ms);

        Ok(RateLimitResult::new(
            weighted < limit,
            limit,
            limit.saturating_sub(weighted),
            window_ms.saturating_sub(elapsed),
        ))
    }
}

impl Algorithm for SlidingWindow {
    fn name(&self) -> &'static str {
        "sliding-window"
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
        self.check(storage, identity, limit, self.window_seconds)
            .await
    }

    async fn status<S: Storage>(
        &self,
        storage: &S,
        identity: &str,
        limit: u64,
    ) -> Result<RateLimitResult> {
        self.peek(storage, identity, limit, self.window_seconds)
            .await
    }

    async fn reset<S: Storage>(&self, storage: &S, identity: &str) -> Result<()> {
        storage.delete(&Self::key(identity)).await
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStorage;

    fn setup(window_seconds: u64, max_requests: u64) -> (SlidingWindow, MemoryStorage, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        let algorithm =
            SlidingWindow::new(window_seconds, max_requests).with_clock(Arc::new(clock.clone()));
        let storage = MemoryStorage::new().with_clock(Arc::new(clock.clone()));
        (algorithm, storage, clock)
    }

    #[tokio::test]
    async fn test_sliding_window_basic() {
        let (algorithm, storage, _clock) = setup(60, 5);

        for i in 1..=5 {
            let result = algorithm.check_and_record(&storage, "user1", 5).await.unwrap();
            assert!(result.is_allowed(), "Request {} should be allowed", i);
            assert_eq!(result.remaining(), 5 - i);
        }

        let result = algorithm.check_and_record(&storage, "user1", 5).await.unwrap();
        assert!(result.is_denied());
        assert_eq!(result.remaining(), 0);
    }

    #[tokio::test]
    async fn test_previous_window_carries_over() {
        let (algorithm, storage, clock) = setup(60, 10);

        for _ in 0..10 {
            algorithm.check_and_record(&storage, "user1", 10).await.unwrap();
        }

        // A quarter into the next window, 75% of the old count still applies.
        clock.advance(Duration::from_secs(75));
        let result = algorithm.check_and_record(&storage, "user1", 10).await.unwrap();
        assert!(result.is_allowed());
        assert_eq!(result.remaining(), 10 - 8);
        assert_eq!(result.reset_time_ms(), 45_000);

        let entry = storage.get("sliding:user1").await.unwrap().unwrap();
        assert_eq!(entry.prev_count, 10);
        assert_eq!(entry.count, 1);
        assert_eq!(entry.window_start, 1_060_000);
    }

    #[tokio::test]
    async fn test_weighted_count_is_continuous_across_slide() {
        let (algorithm, storage, clock) = setup(10, 100);

        for _ in 0..20 {
            algorithm.check_and_record(&storage, "user1", 100).await.unwrap();
        }

        clock.advance(Duration::from_millis(9_999));
        let before = algorithm.check_and_record(&storage, "user1", 100).await.unwrap();
        clock.advance(Duration::from_millis(1));
        let after = algorithm.check_and_record(&storage, "user1", 100).await.unwrap();

        // 21 in the window just before the boundary, 21 + 1 carried over just after.
        assert_eq!(before.remaining(), 100 - 21);
        assert_eq!(after.remaining(), 100 - 22);
        assert_eq!(before.reset_time_ms(), 1);
        assert_eq!(after.reset_time_ms(), 10_000);
    }

    #[tokio::test]
    async fn test_reset_time_decreases_within_window() {
        let (algorithm, storage, clock) = setup(60, 100);

        let mut last = u64::MAX;
        for _ in 0..6 {
            let result = algorithm.check_and_record(&storage, "user1", 100).await.unwrap();
            assert!(result.reset_time_ms() < last);
            last = result.reset_time_ms();
            clock.advance(Duration::from_secs(7));
        }
    }

    #[tokio::test]
    async fn test_long_idle_forgets_previous_window() {
        let (algorithm, storage, clock) = setup(60, 5);

        for _ in 0..5 {
            algorithm.check_and_record(&storage, "user1", 5).await.unwrap();
        }

        clock.advance(Duration::from_secs(130));
        let state = CountScript {
            limit: 5,
            window_ms: 60_000,
        };
        let (entry, reply) = state.apply(Some(StorageEntry::new(5, 1_000_000)), 1_100_000);
        assert!(reply.allowed);
        assert_eq!(entry.prev_count, 5);
        assert_eq!(entry.window_start, 1_060_000);

        let (entry, _) = state.apply(Some(StorageEntry::new(5, 1_000_000)), 1_130_000);
        assert_eq!(entry.prev_count, 0);
        assert_eq!(entry.window_start, 1_120_000);

        let result = algorithm.check_and_record(&storage, "user1", 5).await.unwrap();
        assert_eq!(result.remaining(), 4);
    }

    #[tokio::test]
    async fn test_peek_is_idempotent_and_read_only() {
        let (algorithm, storage, _clock) = setup(60, 5);

        for _ in 0..2 {
            algorithm.check_and_record(&storage, "user1", 5).await.unwrap();
        }

        let first = algorithm.status(&storage, "user1", 5).await.unwrap();
        let second = algorithm.status(&storage, "user1", 5).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.remaining(), 3);
        assert_eq!(storage.get("sliding:user1").await.unwrap().unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_peek_unknown_identity() {
        let (algorithm, storage, _clock) = setup(60, 5);

        let result = algorithm.peek(&storage, "nobody", 5, 60).await.unwrap();
        assert!(result.is_allowed());
        assert_eq!(result.remaining(), 5);
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_custom_limit_and_window() {
        let (algorithm, storage, _clock) = setup(60, 100);

        for _ in 0..3 {
            assert!(algorithm.check(&storage, "user1", 3, 10).await.unwrap().is_allowed());
        }
        let result = algorithm.check(&storage, "user1", 3, 10).await.unwrap();
        assert!(result.is_denied());
        assert_eq!(result.reset_time_ms(), 10_000);
    }

    #[test]
    fn test_clock_skew_does_not_slide_backwards() {
        let script = CountScript {
            limit: 10,
            window_ms: 60_000,
        };

        let (entry, reply) = script.apply(Some(StorageEntry::new(4, 120_000)), 119_000);
        assert!(reply.allowed);
        assert_eq!(reply.value, 5);
        assert_eq!(reply.reset_ms, 60_000);
        assert_eq!(entry.window_start, 120_000);
    }
}
