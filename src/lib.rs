//! Resilient distributed rate limiting for Rust.
//!
//! `resilient_ratelimit` decides, per identity, whether a request may proceed:
//!
//! - **Shared Counters**: Fixed Window, Token Bucket and Sliding Window run
//!   against a store shared by every instance, each as one atomic script
//! - **Circuit Breaker**: backend failures open the circuit after a threshold
//!   and a probe closes it again once the store recovers
//! - **Local Fallback**: while the circuit is open, an in-process limiter
//!   answers so callers always get a decision
//! - **Pluggable Storage**: In-memory with GC, Redis with connection pooling
//!
//! # Quick Start
//!
//! ```ignore
//! use resilient_ratelimit::prelude::*;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = RateLimitConfig::default()
//!         .with_algorithm(AlgorithmKind::TokenBucket)
//!         .with_bucket_capacity(20);
//!
//!     let limiter = ResilientRateLimiter::builder(config)
//!         .build(MemoryStorage::new())
//!         .unwrap();
//!
//!     let result = limiter.check_rate_limit("user:123").await;
//!     if result.is_allowed() {
//!         println!("Request allowed! {} remaining", result.remaining());
//!     } else {
//!         println!("Rate limited! Retry after {:?}", result.retry_after());
//!     }
//! }
//! ```
//!
//! # Algorithms
//!
//! | Algorithm | Best For | Custom limit | Config name |
//! |-----------|----------|--------------|-------------|
//! | Sliding Window | General purpose (default) | Honored | `sliding-window` |
//! | Token Bucket | Bursty traffic | Ignored | `token-bucket` |
//! | Fixed Window | Simple use cases | Honored | `fixed-window` |
//!
//! # Feature Flags
//!
//! - `memory` (default): In-memory storage with garbage collection
//! - `redis`: Redis storage backend

pub mod algorithm;
pub mod breaker;
pub mod clock;
pub mod config;
pub mod decision;
pub mod error;
pub mod fallback;
pub mod headers;
pub mod metrics;
pub mod resilient;
pub mod storage;

// Re-export main types
pub use algorithm::{Algorithm, SelectedAlgorithm};
pub use config::{AlgorithmKind, BreakerConfig, RateLimitConfig};
pub use decision::RateLimitResult;
pub use error::{ConfigError, ConnectionError, MetricsError, RateLimitError, Result, StorageError};
pub use resilient::{LimiterStatus, Mode, ResilientRateLimiter, ResilientRateLimiterBuilder};
pub use storage::{Script, ScriptReply, Storage, StorageEntry};

// Re-export resilience types
pub use breaker::{BreakerStatus, CircuitBreaker, CircuitState};
pub use fallback::LocalRateLimiter;
pub use metrics::{MetricsSink, NoopMetrics};

pub use clock::{Clock, ManualClock, SystemClock};
pub use headers::RateLimitHeaders;

// Re-export algorithms
pub use algorithm::{FixedWindow, SlidingWindow, TokenBucket};

// Re-export storage types
#[cfg(feature = "memory")]
pub use storage::{GcConfig, GcInterval, MemoryStorage};

#[cfg(feature = "redis")]
pub use storage::{RedisConfig, RedisStorage};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::algorithm::Algorithm;
    pub use crate::config::{AlgorithmKind, RateLimitConfig};
    pub use crate::decision::RateLimitResult;
    pub use crate::error::{RateLimitError, Result};
    pub use crate::resilient::{Mode, ResilientRateLimiter};
    pub use crate::storage::Storage;

    pub use crate::algorithm::{FixedWindow, SlidingWindow, TokenBucket};
    pub use crate::breaker::{CircuitBreaker, CircuitState};
    pub use crate::fallback::LocalRateLimiter;

    #[cfg(feature = "memory")]
    pub use crate::storage::{GcConfig, GcInterval, MemoryStorage};

    #[cfg(feature = "redis")]
    pub use crate::storage::{RedisConfig, RedisStorage};
}
