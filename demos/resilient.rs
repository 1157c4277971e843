//! Resilient rate limiting demo: a store outage and recovery.
//!
//! Run with:
//! ```
//! cargo run --example resilient --features memory
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use resilient_ratelimit::{
    BreakerConfig, MemoryStorage, RateLimitConfig, RateLimitHeaders, ResilientRateLimiter,
    Result, Script, ScriptReply, Storage, StorageEntry, StorageError,
};

/// Memory store with an on/off switch standing in for a network partition.
#[derive(Debug, Default)]
struct SwitchableStore {
    inner: MemoryStorage,
    down: AtomicBool,
}

impl SwitchableStore {
    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::Relaxed) {
            return Err(StorageError::operation_failed("connection refused").into());
        }
        Ok(())
    }
}

impl Storage for SwitchableStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64> {
        self.check()?;
        self.inner.increment(key, ttl).await
    }

    async fn counter(&self, key: &str) -> Result<Option<u64>> {
        self.check()?;
        self.inner.counter(key).await
    }

    async fn get(&self, key: &str) -> Result<Option<StorageEntry>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn execute_atomic<S: Script>(&self, key: &str, script: &S, now: u64) -> Result<ScriptReply> {
        self.check()?;
        self.inner.execute_atomic(key, script, now).await
    }
}

async fn burst(limiter: &ResilientRateLimiter<Arc<SwitchableStore>>, requests: usize) {
    for i in 1..=requests {
        let result = limiter.check_rate_limit("user:123").await;
        let mode = limiter.current_mode();

        if result.is_allowed() {
            println!("Request {i}: ✅ Allowed via {mode} (remaining: {})", result.remaining());
        } else {
            println!("Request {i}: ❌ Denied via {mode} (retry after: {:?})", result.retry_after());
        }
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let config = RateLimitConfig::default()
        .with_max_requests(5)
        .with_breaker(BreakerConfig::new(3, Duration::from_secs(1))?);

    let store = Arc::new(SwitchableStore::default());
    let limiter = ResilientRateLimiter::builder(config).build(store.clone())?;

    println!("=== Resilient Rate Limiting Demo ===\n");
    println!("Sliding window: 5 requests / 60s, breaker opens after 3 failures\n");

    burst(&limiter, 6).await;

    println!("\n--- Store goes down ---\n");
    store.down.store(true, Ordering::Relaxed);
    burst(&limiter, 4).await;
    println!("\nStatus: {}", serde_json::to_string_pretty(&limiter.status())?);

    println!("\n--- Store recovers, waiting for the breaker timeout ---\n");
    store.down.store(false, Ordering::Relaxed);
    tokio::time::sleep(Duration::from_secs(1)).await;

    let result = limiter.check_rate_limit("user:123").await;
    println!("Probe answered by {}:", limiter.current_mode());
    for (name, value) in RateLimitHeaders::from(&result)
        .policy(limiter.current_mode())
        .to_vec()
    {
        println!("  {name}: {value}");
    }

    Ok(())
}
