//! Rate limiter configuration.
//!
//! A [`RateLimitConfig`] is the static set of options the orchestrator is
//! built from. It deserializes from the camelCase keys used by service
//! configuration files:
//!
//! ```ignore
//! use resilient_ratelimit::{AlgorithmKind, RateLimitConfig};
//!
//! let config = RateLimitConfig::default()
//!     .with_algorithm(AlgorithmKind::TokenBucket)
//!     .with_bucket_capacity(20)
//!     .with_refill_rate(2.0);
//! config.validate()?;
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ConfigError;

/// The limiting algorithm selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlgorithmKind {
    /// Calendar-aligned counters, see [`FixedWindow`](crate::FixedWindow).
    FixedWindow,
    /// Continuously refilling bucket, see [`TokenBucket`](crate::TokenBucket).
    TokenBucket,
    /// Weighted two-window estimate, see [`SlidingWindow`](crate::SlidingWindow).
    #[default]
    SlidingWindow,
}

impl AlgorithmKind {
    /// All supported algorithms.
    pub const ALL: [AlgorithmKind; 3] = [
        AlgorithmKind::FixedWindow,
        AlgorithmKind::TokenBucket,
        AlgorithmKind::SlidingWindow,
    ];

    /// Configuration name of the algorithm.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FixedWindow => "fixed-window",
            Self::TokenBucket => "token-bucket",
            Self::SlidingWindow => "sliding-window",
        }
    }

    /// Resolve a configured name, falling back to fixed window when unknown.
    pub fn from_name_or_default(name: &str) -> Self {
        match name.parse() {
            Ok(kind) => kind,
            Err(_) => {
                tracing::warn!(
                    algorithm = name,
                    fallback = Self::FixedWindow.as_str(),
                    "Unknown rate limit algorithm, using fallback"
                );
                Self::FixedWindow
            }
        }
    }
}

impl fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlgorithmKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s.trim())
            .ok_or_else(|| ConfigError::InvalidAlgorithm(s.to_string()))
    }
}

impl<'de> Deserialize<'de> for AlgorithmKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::from_name_or_default(&name))
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakerConfig {
    /// Consecutive primary failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a probe is attempted.
    pub recovery_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout_ms: 30_000,
        }
    }
}

impl BreakerConfig {
    /// Create a validated breaker configuration.
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Result<Self, ConfigError> {
        let config = Self {
            failure_threshold,
            recovery_timeout_ms: u64::try_from(recovery_timeout.as_millis()).unwrap_or(u64::MAX),
        };
        config.validate()?;
        Ok(config)
    }

    /// Recovery timeout as a Duration.
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    /// Check the thresholds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::InvalidBreaker(
                "failureThreshold must be greater than 0".into(),
            ));
        }
        if self.recovery_timeout_ms == 0 {
            return Err(ConfigError::InvalidBreaker(
                "recoveryTimeoutMs must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Static rate limiter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitConfig {
    /// Algorithm run against the shared store.
    pub algorithm: AlgorithmKind,
    /// Token bucket capacity.
    pub bucket_capacity: u64,
    /// Token bucket refill rate, tokens per second.
    pub refill_rate: f64,
    /// Requests per window for the window algorithms.
    pub max_requests: u64,
    /// Window length for the window algorithms.
    pub window_size_seconds: u64,
    /// Circuit breaker thresholds.
    pub breaker: BreakerConfig,
    /// Upper bound on a single store round trip.
    pub operation_timeout_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            algorithm: AlgorithmKind::SlidingWindow,
            bucket_capacity: 10,
            refill_rate: 1.0,
            max_requests: 10,
            window_size_seconds: 60,
            breaker: BreakerConfig::default(),
            operation_timeout_ms: 1_000,
        }
    }
}

impl RateLimitConfig {
    /// Set the algorithm.
    pub fn with_algorithm(mut self, algorithm: AlgorithmKind) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Set the token bucket capacity.
    pub fn with_bucket_capacity(mut self, capacity: u64) -> Self {
        self.bucket_capacity = capacity;
        self
    }

    /// Set the token bucket refill rate (tokens per second).
    pub fn with_refill_rate(mut self, rate: f64) -> Self {
        self.refill_rate = rate;
        self
    }

    /// Set the requests allowed per window.
    pub fn with_max_requests(mut self, max_requests: u64) -> Self {
        self.max_requests = max_requests;
        self
    }

    /// Set the window length in seconds.
    pub fn with_window_size_seconds(mut self, seconds: u64) -> Self {
        self.window_size_seconds = seconds;
        self
    }

    /// Set the breaker thresholds.
    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Set the store operation timeout.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Window length as a Duration.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_size_seconds)
    }

    /// Store operation timeout as a Duration.
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// The limit applied when the caller supplies no override.
    pub fn default_limit(&self) -> u64 {
        match self.algorithm {
            AlgorithmKind::TokenBucket => self.bucket_capacity,
            AlgorithmKind::FixedWindow | AlgorithmKind::SlidingWindow => self.max_requests,
        }
    }

    /// Check all values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket_capacity == 0 {
            return Err(ConfigError::InvalidQuota(
                "bucketCapacity must be greater than 0".into(),
            ));
        }
        if !self.refill_rate.is_finite() || self.refill_rate <= 0.0 {
            return Err(ConfigError::InvalidQuota(
                "refillRate must be a positive number".into(),
            ));
        }
        if self.max_requests == 0 {
            return Err(ConfigError::InvalidQuota(
                "maxRequests must be greater than 0".into(),
            ));
        }
        if self.window_size_seconds == 0 {
            return Err(ConfigError::InvalidQuota(
                "windowSizeSeconds must be greater than 0".into(),
            ));
        }
        if self.operation_timeout_ms == 0 {
            return Err(ConfigError::InvalidQuota(
                "operationTimeoutMs must be greater than 0".into(),
            ));
        }
        self.breaker.validate()
    }
}
