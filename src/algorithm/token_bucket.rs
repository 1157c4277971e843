//! Token Bucket rate limiting algorithm.

use std::sync::Arc;
use std::time::Duration;

use crate::algorithm::Algorithm;
use crate::clock::{self, Clock};
use crate::decision::RateLimitResult;
use crate::error::Result;
use crate::storage::{Script, ScriptReply, Storage, StorageEntry};

// Mirrored by `apply` below for in-process stores; change both together.
// tests/redis_parity.rs compares them against a live server.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local requested = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local bucket = redis.call('HMGET', key, 'tokens', 'last_update')
local tokens = tonumber(bucket[1])
local last_update = tonumber(bucket[2])

if tokens == nil then
    tokens = capacity
    last_update = now
end

local elapsed = math.max(0, now - last_update) / 1000.0
tokens = math.min(capacity, tokens + elapsed * refill_rate)

local allowed = 0
local retry_after = 0
if tokens >= requested then
    tokens = tokens - requested
    allowed = 1
else
    retry_after = math.ceil((requested - tokens) / refill_rate * 1000)
end

redis.call('HSET', key, 'tokens', tokens, 'last_update', math.max(now, last_update))
redis.call('PEXPIRE', key, ttl)

return {allowed, math.floor(tokens), retry_after}
"#;

/// One refill-and-consume step, run atomically by the store.
#[derive(Debug, Clone, Copy)]
struct ConsumeScript {
    capacity: f64,
    refill_rate: f64,
    requested: f64,
}

impl ConsumeScript {
    /// Idle buckets expire after twice the time a full refill takes.
    fn ttl_ms(&self) -> u64 {
        ((self.capacity / self.refill_rate).ceil() * 2.0 * 1000.0).max(1000.0) as u64
    }
}

impl Script for ConsumeScript {
    fn source(&self) -> &'static str {
        TOKEN_BUCKET_SCRIPT
    }

    fn args(&self, now: u64) -> Vec<String> {
        vec![
            self.capacity.to_string(),
            self.refill_rate.to_string(),
            self.requested.to_string(),
            now.to_string(),
            self.ttl_ms().to_string(),
        ]
    }

    fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms())
    }

    fn apply(&self, current: Option<StorageEntry>, now: u64) -> (StorageEntry, ScriptReply) {
        let (tokens, last_update) = match current {
            Some(e) => (e.tokens.unwrap_or(self.capacity), e.last_update),
            None => (self.capacity, now),
        };

        let elapsed_secs = now.saturating_sub(last_update) as f64 / 1000.0;
        let mut tokens = (tokens + elapsed_secs * self.refill_rate).min(self.capacity);

        let mut retry_after_ms = 0;
        let allowed = tokens >= self.requested;
        if allowed {
            tokens -= self.requested;
        } else {
            retry_after_ms = ((self.requested - tokens) / self.refill_rate * 1000.0).ceil() as u64;
        }

        let entry = StorageEntry::with_tokens(tokens, now.max(last_update));
        let reply = ScriptReply {
            allowed,
            value: tokens.floor() as u64,
            reset_ms: retry_after_ms,
        };
        (entry, reply)
    }
}

/// Token Bucket rate limiting algorithm.
///
/// Each identity owns a bucket of `capacity` tokens that refills
/// continuously at `refill_rate` tokens per second. The refill is persisted
/// on every call, including denials.
///
/// Capacity is fixed when the bucket is configured: a per-call limit
/// override passed through [`Algorithm::check_and_record`] is ignored.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: u64,
    refill_rate: f64,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    /// Create a new Token Bucket algorithm instance.
    pub fn new(capacity: u64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            clock: clock::system(),
        }
    }

    /// Read time from `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn key(identity: &str) -> String {
        format!("bucket:{identity}")
    }

    /// Take `tokens` from the identity's bucket.
    ///
    /// `reset_time_ms` of the result is the retry-after time on denial and
    /// zero when allowed.
    pub async fn try_consume<S: Storage>(
        &self,
        storage: &S,
        identity: &str,
        tokens: u64,
        capacity: u64,
        refill_rate: f64,
    ) -> Result<RateLimitResult> {
        let script = ConsumeScript {
            capacity: capacity as f64,
            refill_rate,
            requested: tokens as f64,
        };
        let now = self.clock.now_millis();

        let reply = storage
            .execute_atomic(&Self::key(identity), &script, now)
            .await?;

        Ok(RateLimitResult::new(
            reply.allowed,
            capacity,
            reply.value,
            reply.reset_ms,
        ))
    }

    /// Zero-token probe: refill and report without consuming.
    pub async fn bucket_status<S: Storage>(&self, storage: &S, identity: &str) -> Result<RateLimitResult> {
        self.try_consume(storage, identity, 0, self.capacity, self.refill_rate)
            .await
    }
}

impl Algorithm for TokenBucket {
    fn name(&self) -> &'static str {
        "token-bucket"
    }

    fn default_limit(&self) -> u64 {
        self.capacity
    }

    async fn check_and_record<S: Storage>(
        &self,
        storage: &S,
        identity: &str,
        _limit: u64,
    ) -> Result<RateLimitResult> {
        self.try_consume(storage, identity, 1, self.capacity, self.refill_rate)
            .await
    }

    async fn status<S: Storage>(
        &self,
        storage: &S,
        identity: &str,
        _limit: u64,
    ) -> Result<RateLimitResult> {
        self.bucket_status(storage, identity).await
    }

    async fn reset<S: Storage>(&self, storage: &S, identity: &str) -> Result<()> {
        storage.delete(&Self::key(identity)).await
    }
}
