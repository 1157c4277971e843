//! Integration tests for breaker-guarded fallback behaviour.

#![cfg(feature = "memory")]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use resilient_ratelimit::{
    AlgorithmKind, CircuitState, ManualClock, MemoryStorage, MetricsError, Mode, RateLimitConfig,
    ResilientRateLimiter, Result, Script, ScriptReply, Storage, StorageEntry, StorageError,
};
use tokio_test::{assert_err, assert_ok};

/// Memory store that can be switched off and counts every call.
#[derive(Debug)]
struct FlakyStorage {
    inner: MemoryStorage,
    down: AtomicBool,
    calls: AtomicU64,
}

impl FlakyStorage {
    fn new(clock: &ManualClock) -> Self {
        Self {
            inner: MemoryStorage::new().with_clock(Arc::new(clock.clone())),
            down: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        }
    }

    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn guard(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(StorageError::operation_failed("connection refused").into());
        }
        Ok(())
    }
}

impl Storage for FlakyStorage {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64> {
        self.guard()?;
        self.inner.increment(key, ttl).await
    }

    async fn counter(&self, key: &str) -> Result<Option<u64>> {
        self.guard()?;
        self.inner.counter(key).await
    }

    async fn get(&self, key: &str) -> Result<Option<StorageEntry>> {
        self.guard()?;
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.guard()?;
        self.inner.delete(key).await
    }

    async fn execute_atomic<S: Script>(&self, key: &str, script: &S, now: u64) -> Result<ScriptReply> {
        self.guard()?;
        self.inner.execute_atomic(key, script, now).await
    }
}

/// Store whose calls never complete.
#[derive(Debug)]
struct HangingStorage;

impl Storage for HangingStorage {
    async fn increment(&self, _key: &str, _ttl: Duration) -> Result<u64> {
        std::future::pending().await
    }

    async fn counter(&self, _key: &str) -> Result<Option<u64>> {
        std::future::pending().await
    }

    async fn get(&self, _key: &str) -> Result<Option<StorageEntry>> {
        std::future::pending().await
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        std::future::pending().await
    }

    async fn execute_atomic<S: Script>(&self, _key: &str, _script: &S, _now: u64) -> Result<ScriptReply> {
        std::future::pending().await
    }
}

/// Store that answers scripts with a reply of the wrong shape.
#[derive(Debug, Default)]
struct GarbageStorage;

impl Storage for GarbageStorage {
    async fn increment(&self, _key: &str, _ttl: Duration) -> Result<u64> {
        Ok(1)
    }

    async fn counter(&self, _key: &str) -> Result<Option<u64>> {
        Ok(None)
    }

    async fn get(&self, _key: &str) -> Result<Option<StorageEntry>> {
        Ok(None)
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn execute_atomic<S: Script>(&self, _key: &str, _script: &S, _now: u64) -> Result<ScriptReply> {
        Ok(ScriptReply::from_raw(&[])?)
    }
}

fn build(
    config: RateLimitConfig,
) -> (ResilientRateLimiter<Arc<FlakyStorage>>, Arc<FlakyStorage>, ManualClock) {
    let clock = ManualClock::new(1_700_000_000_000);
    let storage = Arc::new(FlakyStorage::new(&clock));
    let limiter = ResilientRateLimiter::builder(config)
        .clock(Arc::new(clock.clone()))
        .build(storage.clone())
        .unwrap();
    (limiter, storage, clock)
}

#[tokio::test]
async fn test_outage_opens_circuit_and_skips_store() {
    let (limiter, storage, _clock) = build(RateLimitConfig::default());
    storage.set_down(true);

    for i in 1..=3 {
        let result = limiter.check_rate_limit("alice").await;
        assert!(result.is_allowed(), "Request {} should be served by the fallback", i);
    }
    assert_eq!(storage.calls(), 3);
    assert_eq!(limiter.breaker().state(), CircuitState::Open);
    assert_eq!(limiter.current_mode(), Mode::Fallback);
    assert_eq!(limiter.current_mode().to_string(), "local-fallback");

    // Open circuit: the store is not touched at all.
    let result = limiter.check_rate_limit("alice").await;
    assert!(result.is_allowed());
    assert_eq!(storage.calls(), 3);
    assert!(limiter.is_using_fallback());
}

#[tokio::test]
async fn test_probe_after_timeout_recovers() {
    let (limiter, storage, clock) = build(RateLimitConfig::default());
    storage.set_down(true);
    for _ in 0..3 {
        limiter.check_rate_limit("alice").await;
    }

    storage.set_down(false);
    clock.advance(Duration::from_secs(29));
    limiter.check_rate_limit("alice").await;
    assert_eq!(storage.calls(), 3, "no probe before the recovery timeout");

    clock.advance(Duration::from_secs(1));
    let result = limiter.check_rate_limit("alice").await;
    assert!(result.is_allowed());
    assert_eq!(storage.calls(), 4);
    assert_eq!(limiter.breaker().state(), CircuitState::Closed);
    assert_eq!(
        limiter.current_mode(),
        Mode::Algorithm(AlgorithmKind::SlidingWindow)
    );
}

#[tokio::test]
async fn test_failed_probe_reopens() {
    let (limiter, storage, clock) = build(RateLimitConfig::default());
    storage.set_down(true);
    for _ in 0..3 {
        limiter.check_rate_limit("alice").await;
    }

    clock.advance(Duration::from_secs(30));
    limiter.check_rate_limit("alice").await;
    assert_eq!(storage.calls(), 4);
    assert_eq!(limiter.breaker().state(), CircuitState::Open);
    assert_eq!(
        limiter.breaker().time_until_half_open(),
        Some(Duration::from_secs(30))
    );
}

#[tokio::test]
async fn test_fallback_enforces_limit_per_identity() {
    let config = RateLimitConfig::default().with_max_requests(3);
    let (limiter, storage, _clock) = build(config);
    storage.set_down(true);

    for _ in 0..3 {
        assert!(limiter.check_rate_limit("alice").await.is_allowed());
    }
    let result = limiter.check_rate_limit("alice").await;
    assert!(result.is_denied());
    assert_eq!(result.limit(), 3);

    assert!(limiter.check_rate_limit("bob").await.is_allowed());
    assert_eq!(limiter.status().fallback_active_identities, 2);
}

#[tokio::test]
async fn test_fallback_receives_custom_limit() {
    let (limiter, storage, _clock) = build(RateLimitConfig::default());
    storage.set_down(true);

    for _ in 0..20 {
        assert!(limiter.check_rate_limit_with_limit("vip", 20).await.is_allowed());
    }
    assert!(limiter.check_rate_limit_with_limit("vip", 20).await.is_denied());
}

#[tokio::test]
async fn test_denial_is_not_a_backend_failure() {
    let config = RateLimitConfig::default().with_max_requests(1);
    let (limiter, _storage, _clock) = build(config);

    for _ in 0..10 {
        limiter.check_rate_limit("alice").await;
    }
    assert_eq!(limiter.breaker().state(), CircuitState::Closed);
    assert_eq!(limiter.breaker().failure_count(), 0);
}

#[tokio::test]
async fn test_manual_breaker_reset() {
    let (limiter, storage, _clock) = build(RateLimitConfig::default());
    storage.set_down(true);
    for _ in 0..3 {
        limiter.check_rate_limit("alice").await;
    }

    storage.set_down(false);
    limiter.reset_breaker();
    assert!(!limiter.is_using_fallback());

    limiter.check_rate_limit("alice").await;
    assert_eq!(storage.calls(), 4);
}

#[tokio::test]
async fn test_inspect_surfaces_store_errors() {
    let (limiter, storage, _clock) = build(RateLimitConfig::default());

    limiter.check_rate_limit("alice").await;
    assert_ok!(limiter.inspect("alice").await);

    storage.set_down(true);
    assert_err!(limiter.inspect("alice").await);
    assert_eq!(limiter.breaker().state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_slow_store_times_out_into_fallback() {
    let config = RateLimitConfig::default().with_operation_timeout(Duration::from_millis(50));
    let limiter = ResilientRateLimiter::builder(config)
        .build(HangingStorage)
        .unwrap();

    for _ in 0..3 {
        assert!(limiter.check_rate_limit("alice").await.is_allowed());
    }
    assert_eq!(limiter.breaker().state(), CircuitState::Open);
}

#[tokio::test]
async fn test_malformed_reply_counts_as_failure() {
    let limiter = ResilientRateLimiter::builder(RateLimitConfig::default())
        .build(GarbageStorage)
        .unwrap();

    let result = limiter.check_rate_limit("alice").await;
    assert!(result.is_allowed());
    assert_eq!(limiter.breaker().failure_count(), 1);
}

#[tokio::test]
async fn test_metrics_sink_failure_is_swallowed() {
    let clock = ManualClock::new(0);
    let recorded = Arc::new(AtomicU64::new(0));
    let sink_calls = recorded.clone();
    let sink = move |_: &str, _: bool, _: Duration| {
        sink_calls.fetch_add(1, Ordering::SeqCst);
        Err::<(), _>(MetricsError("sink offline".into()))
    };

    let config = RateLimitConfig::default().with_max_requests(2);
    let limiter = ResilientRateLimiter::builder(config)
        .clock(Arc::new(clock.clone()))
        .metrics(Arc::new(sink))
        .build(MemoryStorage::new().with_clock(Arc::new(clock)))
        .unwrap();

    assert!(limiter.check_rate_limit("alice").await.is_allowed());
    assert!(limiter.check_rate_limit("alice").await.is_allowed());
    assert!(limiter.check_rate_limit("alice").await.is_denied());
    assert_eq!(recorded.load(Ordering::SeqCst), 3);
    assert_eq!(limiter.breaker().failure_count(), 0);
}

#[tokio::test]
async fn test_metrics_see_fallback_decisions() {
    let allowed = Arc::new(AtomicU64::new(0));
    let denied = Arc::new(AtomicU64::new(0));
    let (a, d) = (allowed.clone(), denied.clone());
    let sink = move |_: &str, ok: bool, _: Duration| {
        if ok {
            a.fetch_add(1, Ordering::SeqCst);
        } else {
            d.fetch_add(1, Ordering::SeqCst);
        }
        Ok::<(), MetricsError>(())
    };

    let clock = ManualClock::new(0);
    let storage = Arc::new(FlakyStorage::new(&clock));
    storage.set_down(true);
    let limiter = ResilientRateLimiter::builder(RateLimitConfig::default().with_max_requests(1))
        .clock(Arc::new(clock))
        .metrics(Arc::new(sink))
        .build(storage)
        .unwrap();

    limiter.check_rate_limit("alice").await;
    limiter.check_rate_limit("alice").await;
    assert_eq!(allowed.load(Ordering::SeqCst), 1);
    assert_eq!(denied.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_panicking_metrics_sink_does_not_escape() {
    let sink = |_: &str, _: bool, _: Duration| -> std::result::Result<(), MetricsError> {
        panic!("sink exploded")
    };

    let clock = ManualClock::new(0);
    let limiter = ResilientRateLimiter::builder(RateLimitConfig::default().with_max_requests(1))
        .clock(Arc::new(clock.clone()))
        .metrics(Arc::new(sink))
        .build(MemoryStorage::new().with_clock(Arc::new(clock)))
        .unwrap();

    assert!(limiter.check_rate_limit("alice").await.is_allowed());
    assert!(limiter.check_rate_limit("alice").await.is_denied());
    assert_eq!(limiter.breaker().failure_count(), 0);
}
