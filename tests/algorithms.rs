//! Integration tests for rate limiting algorithms.

#![cfg(feature = "memory")]

use std::sync::Arc;
use std::time::Duration;

use resilient_ratelimit::{
    Algorithm, AlgorithmKind, FixedWindow, ManualClock, MemoryStorage, RateLimitConfig,
    SelectedAlgorithm, SlidingWindow, TokenBucket,
};

fn clocked_storage(clock: &ManualClock) -> MemoryStorage {
    MemoryStorage::new().with_clock(Arc::new(clock.clone()))
}

#[tokio::test]
async fn test_token_bucket_burst_then_retry_after() {
    let clock = ManualClock::new(1_700_000_000_000);
    let storage = clocked_storage(&clock);
    let algorithm = TokenBucket::new(10, 1.0).with_clock(Arc::new(clock.clone()));

    for i in 1..=10 {
        let result = algorithm
            .check_and_record(&storage, "alice", 10)
            .await
            .unwrap();
        assert!(result.is_allowed(), "Request {} should be allowed (burst)", i);
    }

    let result = algorithm
        .check_and_record(&storage, "alice", 10)
        .await
        .unwrap();
    assert!(result.is_denied(), "11th request should be denied");
    assert_eq!(result.remaining(), 0);
    assert_eq!(result.retry_after(), Some(Duration::from_secs(1)));

    clock.advance(Duration::from_secs(1));
    let result = algorithm
        .check_and_record(&storage, "alice", 10)
        .await
        .unwrap();
    assert!(result.is_allowed(), "one token refilled after a second");
}

#[tokio::test]
async fn test_fixed_window_counts_past_limit() {
    let clock = ManualClock::new(1_700_000_000_000);
    let storage = clocked_storage(&clock);
    let algorithm =
        FixedWindow::new(Duration::from_secs(60), 10).with_clock(Arc::new(clock.clone()));

    for _ in 0..15 {
        algorithm.check(&storage, "bob", 10).await.unwrap();
    }

    let window_index = 1_700_000_000_000u64 / 60_000;
    let count = resilient_ratelimit::Storage::counter(&storage, &format!("rate:bob:{window_index}"))
        .await
        .unwrap();
    assert_eq!(count, Some(15));

    let result = algorithm.check(&storage, "bob", 10).await.unwrap();
    assert!(result.is_denied());
    assert_eq!(result.remaining(), 0, "remaining is clamped, never negative");
}

#[tokio::test]
async fn test_separate_identities_independent() {
    let clock = ManualClock::new(0);
    let storage = clocked_storage(&clock);
    let algorithm = SlidingWindow::new(60, 2).with_clock(Arc::new(clock.clone()));

    for _ in 0..2 {
        algorithm
            .check_and_record(&storage, "user:1", 2)
            .await
            .unwrap();
    }
    let result = algorithm
        .check_and_record(&storage, "user:1", 2)
        .await
        .unwrap();
    assert!(result.is_denied(), "user:1 should be rate limited");

    let result = algorithm
        .check_and_record(&storage, "user:2", 2)
        .await
        .unwrap();
    assert!(result.is_allowed(), "user:2 should be allowed");
}

#[tokio::test]
async fn test_sliding_window_never_admits_more_than_limit_concurrently() {
    let storage = Arc::new(MemoryStorage::new());
    let algorithm = Arc::new(SlidingWindow::new(60, 50));

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let storage = storage.clone();
            let algorithm = algorithm.clone();
            tokio::spawn(async move {
                let mut allowed = 0;
                for _ in 0..20 {
                    if algorithm
                        .check_and_record(&storage, "hot", 50)
                        .await
                        .unwrap()
                        .is_allowed()
                    {
                        allowed += 1;
                    }
                }
                allowed
            })
        })
        .collect();

    let mut total = 0;
    for task in tasks {
        total += task.await.unwrap();
    }
    assert_eq!(total, 50);
}

#[tokio::test]
async fn test_token_bucket_never_overdrawn_concurrently() {
    let storage = Arc::new(MemoryStorage::new());
    let algorithm = Arc::new(TokenBucket::new(25, 0.001));

    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let storage = storage.clone();
            let algorithm = algorithm.clone();
            tokio::spawn(async move {
                let mut allowed = 0;
                for _ in 0..10 {
                    if algorithm
                        .check_and_record(&storage, "hot", 25)
                        .await
                        .unwrap()
                        .is_allowed()
                    {
                        allowed += 1;
                    }
                }
                allowed
            })
        })
        .collect();

    let mut total = 0;
    for task in tasks {
        total += task.await.unwrap();
    }
    assert_eq!(total, 25);
}

#[tokio::test]
async fn test_selected_algorithm_status_is_idempotent() {
    let clock = ManualClock::new(1_000_000);
    let storage = clocked_storage(&clock);

    for kind in AlgorithmKind::ALL {
        let config = RateLimitConfig::default().with_algorithm(kind);
        let algorithm = SelectedAlgorithm::from_config(&config, Arc::new(clock.clone()));
        let identity = format!("status:{kind}");

        algorithm
            .check_and_record(&storage, &identity, 10)
            .await
            .unwrap();

        let first = algorithm.status(&storage, &identity, 10).await.unwrap();
        let second = algorithm.status(&storage, &identity, 10).await.unwrap();
        assert_eq!(first, second, "{kind} status should not consume");
        assert_eq!(first.remaining(), 9, "{kind} should report one request used");
    }
}

#[tokio::test]
async fn test_reset_forgets_identity() {
    let clock = ManualClock::new(1_000_000);
    let storage = clocked_storage(&clock);

    for kind in AlgorithmKind::ALL {
        let config = RateLimitConfig::default()
            .with_algorithm(kind)
            .with_max_requests(1)
            .with_bucket_capacity(1);
        let algorithm = SelectedAlgorithm::from_config(&config, Arc::new(clock.clone()));

        algorithm.check_and_record(&storage, "dave", 1).await.unwrap();
        assert!(
            algorithm
                .check_and_record(&storage, "dave", 1)
                .await
                .unwrap()
                .is_denied()
        );

        algorithm.reset(&storage, "dave").await.unwrap();
        assert!(
            algorithm
                .check_and_record(&storage, "dave", 1)
                .await
                .unwrap()
                .is_allowed(),
            "{kind} should allow after reset"
        );
        algorithm.reset(&storage, "dave").await.unwrap();
    }
}
