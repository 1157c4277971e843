//! Resilient rate limiter: the configured algorithm behind a circuit breaker,
//! with the local fallback limiter as the secondary path.
//!
//! # Example
//!
//! ```ignore
//! use resilient_ratelimit::prelude::*;
//!
//! let limiter = ResilientRateLimiter::builder(RateLimitConfig::default())
//!     .build(MemoryStorage::new())?;
//!
//! let result = limiter.check_rate_limit("user:123").await;
//! if result.is_denied() {
//!     // reject with 429
//! }
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, Serializer};
use tokio::time::Instant;

use crate::algorithm::{Algorithm, SelectedAlgorithm};
use crate::breaker::{BreakerStatus, CircuitBreaker};
use crate::clock::{self, Clock};
use crate::config::{AlgorithmKind, RateLimitConfig};
use crate::decision::RateLimitResult;
use crate::error::{ConfigError, ConnectionError, Result};
use crate::fallback::LocalRateLimiter;
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::storage::Storage;

/// Which path is answering requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The shared store, through the configured algorithm.
    Algorithm(AlgorithmKind),
    /// The in-process fallback limiter.
    Fallback,
}

impl Mode {
    /// Algorithm name, or `local-fallback`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Algorithm(kind) => kind.as_str(),
            Self::Fallback => "local-fallback",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Mode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Operational snapshot for dashboards.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterStatus {
    /// Path currently answering requests.
    pub mode: Mode,
    /// Configured algorithm, regardless of mode.
    pub algorithm: AlgorithmKind,
    /// Breaker state.
    pub breaker: BreakerStatus,
    /// Identities tracked by the fallback limiter.
    pub fallback_active_identities: usize,
}

/// Builder for [`ResilientRateLimiter`].
pub struct ResilientRateLimiterBuilder<S> {
    config: RateLimitConfig,
    clock: Option<Arc<dyn Clock>>,
    breaker: Option<CircuitBreaker>,
    metrics: Option<Arc<dyn MetricsSink>>,
    fallback: Option<LocalRateLimiter>,
    storage: PhantomData<fn() -> S>,
}

impl<S: Storage> ResilientRateLimiterBuilder<S> {
    /// Clock shared by the algorithm, the breaker and the fallback limiter.
    ///
    /// A breaker or fallback limiter passed in explicitly keeps its own clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use a preconfigured breaker instead of one built from `config.breaker`.
    pub fn breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Report every decision to `metrics`.
    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Use a preconfigured fallback limiter.
    pub fn fallback_limiter(mut self, fallback: LocalRateLimiter) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Validate the configuration and resolve the algorithm.
    pub fn build(self, storage: S) -> std::result::Result<ResilientRateLimiter<S>, ConfigError> {
        let config = self.config;
        config.validate()?;

        let clock = self.clock.unwrap_or_else(clock::system);
        let algorithm = SelectedAlgorithm::from_config(&config, clock.clone());

        let breaker = match self.breaker {
            Some(breaker) => breaker,
            None => CircuitBreaker::new(config.breaker.clone())?.with_clock(clock.clone()),
        };
        let fallback = self.fallback.unwrap_or_else(|| {
            LocalRateLimiter::new(algorithm.default_limit()).with_clock(clock.clone())
        });
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(NoopMetrics));

        tracing::info!(
            algorithm = %config.algorithm,
            default_limit = algorithm.default_limit(),
            failure_threshold = config.breaker.failure_threshold,
            "Rate limiter initialized"
        );

        Ok(ResilientRateLimiter {
            operation_timeout: config.operation_timeout(),
            config,
            storage,
            algorithm,
            breaker,
            fallback,
            metrics,
        })
    }
}

/// Rate limiter that keeps answering when the shared store does not.
///
/// Every check runs the configured algorithm against the shared store as the
/// breaker's primary. When the store errors, times out or the circuit is
/// open, the in-process [`LocalRateLimiter`] answers instead. Callers always
/// receive a [`RateLimitResult`].
pub struct ResilientRateLimiter<S: Storage> {
    config: RateLimitConfig,
    storage: S,
    algorithm: SelectedAlgorithm,
    breaker: CircuitBreaker,
    fallback: LocalRateLimiter,
    metrics: Arc<dyn MetricsSink>,
    operation_timeout: Duration,
}

impl<S: Storage + fmt::Debug> fmt::Debug for ResilientRateLimiter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientRateLimiter")
            .field("algorithm", &self.algorithm.kind())
            .field("storage", &self.storage)
            .field("breaker", &self.breaker.state())
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

impl<S: Storage> ResilientRateLimiter<S> {
    /// Start building a limiter from `config`.
    pub fn builder(config: RateLimitConfig) -> ResilientRateLimiterBuilder<S> {
        ResilientRateLimiterBuilder {
            config,
            clock: None,
            breaker: None,
            metrics: None,
            fallback: None,
            storage: PhantomData,
        }
    }

    /// Check `identity` against the configured default limit.
    pub async fn check_rate_limit(&self, identity: &str) -> RateLimitResult {
        self.check_rate_limit_with_limit(identity, self.algorithm.default_limit())
            .await
    }

    /// Check `identity` against `limit`.
    ///
    /// The token bucket ignores `limit` and enforces its configured capacity.
    /// The fallback limiter always applies `limit`.
    pub async fn check_rate_limit_with_limit(&self, identity: &str, limit: u64) -> RateLimitResult {
        let started = Instant::now();

        let result = self
            .breaker
            .execute(
                || self.primary(identity, limit),
                || self.fallback.check_with_limit(identity, limit),
            )
            .await;

        if result.is_denied() {
            tracing::debug!(
                identity,
                limit = result.limit(),
                reset_ms = result.reset_time_ms(),
                "Rate limit exceeded"
            );
        }

        self.record_metrics(identity, result.is_allowed(), started.elapsed());

        result
    }

    fn record_metrics(&self, identity: &str, allowed: bool, response_time: Duration) {
        let recorded = panic::catch_unwind(AssertUnwindSafe(|| {
            self.metrics.record(identity, allowed, response_time)
        }));
        match recorded {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::warn!(identity, %error, "Failed to record rate limit metrics");
            }
            Err(_) => {
                tracing::error!(identity, "Metrics sink panicked");
            }
        }
    }

    async fn primary(&self, identity: &str, limit: u64) -> Result<RateLimitResult> {
        let check = self.algorithm.check_and_record(&self.storage, identity, limit);
        match tokio::time::timeout(self.operation_timeout, check).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout(self.operation_timeout).into()),
        }
    }

    /// Path currently answering requests.
    pub fn current_mode(&self) -> Mode {
        if self.breaker.is_allowing_requests() {
            Mode::Algorithm(self.algorithm.kind())
        } else {
            Mode::Fallback
        }
    }

    /// Whether requests are currently answered by the fallback limiter.
    pub fn is_using_fallback(&self) -> bool {
        self.current_mode() == Mode::Fallback
    }

    /// Operational snapshot.
    pub fn status(&self) -> LimiterStatus {
        LimiterStatus {
            mode: self.current_mode(),
            algorithm: self.algorithm.kind(),
            breaker: self.breaker.status(),
            fallback_active_identities: self.fallback.active_identities(),
        }
    }

    /// Report the identity's state in the shared store without consuming quota.
    ///
    /// Bypasses the breaker, so store errors are returned to the caller.
    pub async fn inspect(&self, identity: &str) -> Result<RateLimitResult> {
        let status = self
            .algorithm
            .status(&self.storage, identity, self.algorithm.default_limit());
        match tokio::time::timeout(self.operation_timeout, status).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout(self.operation_timeout).into()),
        }
    }

    /// Forget the identity in both the shared store and the fallback limiter.
    pub async fn reset_identity(&self, identity: &str) -> Result<()> {
        self.fallback.forget(identity);
        self.algorithm.reset(&self.storage, identity).await?;
        tracing::info!(identity, "Rate limit state reset");
        Ok(())
    }

    /// Force the breaker closed.
    pub fn reset_breaker(&self) {
        self.breaker.reset();
    }

    /// The configuration this limiter was built from.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// The resolved algorithm.
    pub fn algorithm(&self) -> &SelectedAlgorithm {
        &self.algorithm
    }

    /// The circuit breaker.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// The fallback limiter.
    pub fn fallback(&self) -> &LocalRateLimiter {
        &self.fallback
    }

    /// The shared store.
    pub fn storage(&self) -> &S {
        &self.storage
    }
}
