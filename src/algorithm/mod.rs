//! Rate limiting algorithm trait and implementations.
//!
//! # Available Algorithms
//!
//! - **Fixed Window**: calendar-aligned counter per window
//! - **Token Bucket**: continuously refilling bucket, committed by an atomic script
//! - **Sliding Window**: weighted blend of the current and previous window,
//!   committed by an atomic script
//!
//! The algorithm is chosen once at startup; [`SelectedAlgorithm`] dispatches
//! to it without comparing names on every request.

mod fixed_window;
mod sliding_window;
mod token_bucket;

pub use fixed_window::FixedWindow;
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;

use std::future::Future;
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::{AlgorithmKind, RateLimitConfig};
use crate::decision::RateLimitResult;
use crate::error::Result;
use crate::storage::Storage;

/// Rate limiting algorithm trait.
///
/// Every method performs at most one round trip to the store. Errors are
/// backend failures; a denial is an `Ok` result.
///
/// # Algorithm Comparison
///
/// | Algorithm | Accuracy | Memory | Burst | Custom limit |
/// |-----------|----------|--------|-------|--------------|
/// | Token Bucket | High | Low | Excellent | Ignored |
/// | Sliding Window | Medium | Low | Good | Honored |
/// | Fixed Window | Low | Low | Poor (boundary) | Honored |
pub trait Algorithm: Send + Sync + 'static {
    /// Get the algorithm name (for logging and mode reporting).
    fn name(&self) -> &'static str;

    /// The limit applied when the caller supplies none.
    fn default_limit(&self) -> u64;

    /// Check if a request is allowed AND record it atomically.
    fn check_and_record<S: Storage>(
        &self,
        storage: &S,
        identity: &str,
        limit: u64,
    ) -> impl Future<Output = Result<RateLimitResult>> + Send;

    /// Report the current state without consuming quota.
    fn status<S: Storage>(
        &self,
        storage: &S,
        identity: &str,
        limit: u64,
    ) -> impl Future<Output = Result<RateLimitResult>> + Send;

    /// Forget the identity's current state.
    fn reset<S: Storage>(&self, storage: &S, identity: &str) -> impl Future<Output = Result<()>> + Send;
}

/// The algorithm resolved from configuration.
#[derive(Debug, Clone)]
pub enum SelectedAlgorithm {
    /// See [`FixedWindow`].
    FixedWindow(FixedWindow),
    /// See [`TokenBucket`].
    TokenBucket(TokenBucket),
    /// See [`SlidingWindow`].
    SlidingWindow(SlidingWindow),
}

impl SelectedAlgorithm {
    /// Build the configured algorithm, reading time from `clock`.
    pub fn from_config(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        match config.algorithm {
            AlgorithmKind::FixedWindow => Self::FixedWindow(
                FixedWindow::new(config.window(), config.max_requests).with_clock(clock),
            ),
            AlgorithmKind::TokenBucket => Self::TokenBucket(
                TokenBucket::new(config.bucket_capacity, config.refill_rate).with_clock(clock),
            ),
            AlgorithmKind::SlidingWindow => Self::SlidingWindow(
                SlidingWindow::new(config.window_size_seconds, config.max_requests)
                    .with_clock(clock),
            ),
        }
    }

    /// Which algorithm this is.
    pub fn kind(&self) -> AlgorithmKind {
        match self {
            Self::FixedWindow(_) => AlgorithmKind::FixedWindow,
            Self::TokenBucket(_) => AlgorithmKind::TokenBucket,
            Self::SlidingWindow(_) => AlgorithmKind::SlidingWindow,
        }
    }
}

impl Algorithm for SelectedAlgorithm {
    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    fn default_limit(&self) -> u64 {
        match self {
            Self::FixedWindow(a) => a.default_limit(),
            Self::TokenBucket(a) => a.default_limit(),
            Self::SlidingWindow(a) => a.default_limit(),
        }
    }

    async fn check_and_record<S: Storage>(
        &self,
        storage: &S,
        identity: &str,
        limit: u64,
    ) -> Result<RateLimitResult> {
        match self {
            Self::FixedWindow(a) => a.check_and_record(storage, identity, limit).await,
            Self::TokenBucket(a) => a.check_and_record(storage, identity, limit).await,
            Self::SlidingWindow(a) => a.check_and_record(storage, identity, limit).await,
        }
    }

    async fn status<S: Storage>(
        &self,
        storage: &S,
        identity: &str,
        limit: u64,
    ) -> Result<RateLimitResult> {
        match self {
            Self::FixedWindow(a) => a.status(storage, identity, limit).await,
            Self::TokenBucket(a) => a.status(storage, identity, limit).await,
            Self::SlidingWindow(a) => a.status(storage, identity, limit).await,
        }
    }

    async fn reset<S: Storage>(&self, storage: &S, identity: &str) -> Result<()> {
        match self {
            Self::FixedWindow(a) => a.reset(storage, identity).await,
            Self::TokenBucket(a) => a.reset(storage, identity).await,
            Self::SlidingWindow(a) => a.reset(storage, identity).await,
        }
    }
}

/// Duration in milliseconds, saturating.
pub(crate) fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
