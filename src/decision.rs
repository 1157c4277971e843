//! Decision type for rate limiting results.
//!
//! Every algorithm, and the local fallback limiter, answers with a
//! [`RateLimitResult`]. Callers use it to build response headers and to
//! surface a retry-after hint on denial.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The outcome of a single rate limit decision.
///
/// `remaining` is always clamped into `0..=limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RawResult")]
pub struct RateLimitResult {
    /// Whether the request is allowed.
    allowed: bool,
    /// The quota in force for this decision.
    limit: u64,
    /// Remaining quota after this decision.
    remaining: u64,
    /// Milliseconds until the window or bucket state next changes materially.
    #[serde(rename = "resetTime")]
    reset_time_ms: u64,
}

/// Wire form, clamped through [`RateLimitResult::new`] on the way in.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawResult {
    allowed: bool,
    limit: u64,
    remaining: u64,
    reset_time: u64,
}

impl From<RawResult> for RateLimitResult {
    fn from(raw: RawResult) -> Self {
        Self::new(raw.allowed, raw.limit, raw.remaining, raw.reset_time)
    }
}

impl RateLimitResult {
    /// Create a new result, clamping `remaining` to `limit`.
    pub fn new(allowed: bool, limit: u64, remaining: u64, reset_time_ms: u64) -> Self {
        Self {
            allowed,
            limit,
            remaining: remaining.min(limit),
            reset_time_ms,
        }
    }

    /// Create a new "allowed" result.
    pub fn allowed(limit: u64, remaining: u64, reset_time_ms: u64) -> Self {
        Self::new(true, limit, remaining, reset_time_ms)
    }

    /// Create a new "denied" result.
    pub fn denied(limit: u64, remaining: u64, reset_time_ms: u64) -> Self {
        Self::new(false, limit, remaining, reset_time_ms)
    }

    /// Check if the request is allowed.
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// Check if the request is denied.
    pub fn is_denied(&self) -> bool {
        !self.allowed
    }

    /// The configured limit.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Remaining quota.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Milliseconds until reset.
    pub fn reset_time_ms(&self) -> u64 {
        self.reset_time_ms
    }

    /// Time until reset as a Duration.
    pub fn reset_time(&self) -> Duration {
        Duration::from_millis(self.reset_time_ms)
    }

    /// Reset time rounded up to whole seconds.
    pub fn reset_seconds(&self) -> u64 {
        self.reset_time_ms.div_ceil(1000)
    }

    /// How long a denied caller should wait before retrying.
    ///
    /// `None` for allowed requests.
    pub fn retry_after(&self) -> Option<Duration> {
        self.is_denied().then(|| self.reset_time())
    }
}
