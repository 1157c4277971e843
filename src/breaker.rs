//! Circuit breaker guarding the shared store.
//!
//! The breaker state and the instant it last opened are packed into one
//! `AtomicU64`, so every transition is a single compare-and-set: two callers
//! racing on the same transition can never both win it. The consecutive
//! failure count lives in its own counter.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::clock::{self, Clock};
use crate::config::BreakerConfig;
use crate::error::ConfigError;

const TAG_BITS: u32 = 2;
const TAG_MASK: u64 = 0b11;
const TAG_CLOSED: u64 = 0;
const TAG_OPEN: u64 = 1;
const TAG_HALF_OPEN: u64 = 2;

const CLOSED_WORD: u64 = TAG_CLOSED;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operating mode: calls go to the primary.
    Closed,
    /// Primary is bypassed until the recovery timeout elapses.
    Open,
    /// One probe decides whether to close or reopen.
    HalfOpen,
}

impl CircuitState {
    /// Upper-case name used in logs and status output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }

    fn tag(self) -> u64 {
        match self {
            Self::Closed => TAG_CLOSED,
            Self::Open => TAG_OPEN,
            Self::HalfOpen => TAG_HALF_OPEN,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn pack(state: CircuitState, opened_at: u64) -> u64 {
    (opened_at << TAG_BITS) | state.tag()
}

fn unpack(word: u64) -> (CircuitState, u64) {
    let state = match word & TAG_MASK {
        TAG_OPEN => CircuitState::Open,
        TAG_HALF_OPEN => CircuitState::HalfOpen,
        _ => CircuitState::Closed,
    };
    (state, word >> TAG_BITS)
}

/// Point-in-time view of the breaker for dashboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStatus {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures observed.
    pub failure_count: u32,
    /// Failures that open the circuit.
    pub failure_threshold: u32,
    /// Time the circuit stays open before probing.
    pub timeout_ms: u64,
    /// Whether calls currently reach the primary.
    pub allowing_requests: bool,
    /// Time since the circuit opened, while not closed.
    pub time_in_open_ms: Option<u64>,
    /// Time until a probe is allowed, while open.
    pub time_until_retry_ms: Option<u64>,
}

/// Circuit breaker with fallback routing.
///
/// [`execute`](Self::execute) never fails: it returns either the primary's
/// value or the fallback's.
///
/// - **Closed**: run the primary. A success resets the failure count. A
///   failure increments it and, at the threshold, opens the circuit. The
///   failing call itself is answered by the fallback.
/// - **Open**: answer from the fallback until the recovery timeout has
///   elapsed, then move to half-open and probe in the same call.
/// - **Half-open**: run the primary once. Success closes the circuit,
///   failure reopens it with a fresh timestamp.
///
/// A correctly computed denial is a success of the primary; only errors
/// count as failures.
#[derive(Debug)]
pub struct CircuitBreaker {
    word: AtomicU64,
    failure_count: AtomicU32,
    failure_threshold: u32,
    timeout_ms: u64,
    clock: Arc<dyn Clock>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::from_validated(BreakerConfig::default())
    }
}

impl CircuitBreaker {
    /// Create a breaker, validating the thresholds.
    pub fn new(config: BreakerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_validated(config))
    }

    fn from_validated(config: BreakerConfig) -> Self {
        Self {
            word: AtomicU64::new(CLOSED_WORD),
            failure_count: AtomicU32::new(0),
            failure_threshold: config.failure_threshold,
            timeout_ms: config.recovery_timeout_ms,
            clock: clock::system(),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run `primary` under breaker protection, answering from `fallback`
    /// whenever the primary is bypassed or fails.
    pub async fn execute<T, E, Fut, Op, Fb>(&self, primary: Op, fallback: Fb) -> T
    where
        E: fmt::Display,
        Fut: Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
        Fb: FnOnce() -> T,
    {
        let word = self.word.load(Ordering::Acquire);
        let (state, opened_at) = unpack(word);

        if state == CircuitState::Open {
            let elapsed = self.clock.now_millis().saturating_sub(opened_at);
            if elapsed < self.timeout_ms {
                tracing::debug!(
                    remaining_ms = self.timeout_ms - elapsed,
                    "Circuit breaker open, using fallback"
                );
                return fallback();
            }

            // Losing this race is fine: the winner already moved to half-open.
            if self
                .word
                .compare_exchange(
                    word,
                    pack(CircuitState::HalfOpen, opened_at),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                tracing::info!(elapsed_ms = elapsed, "Circuit breaker → half-open");
            }
        }

        match primary().await {
            Ok(value) => {
                self.on_success();
                value
            }
            Err(error) => {
                self.on_failure(&error);
                fallback()
            }
        }
    }

    fn on_success(&self) {
        let word = self.word.load(Ordering::Acquire);
        match unpack(word).0 {
            CircuitState::HalfOpen => {
                if self
                    .word
                    .compare_exchange(word, CLOSED_WORD, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.failure_count.store(0, Ordering::Release);
                    tracing::info!("Circuit breaker → closed, primary recovered");
                }
            }
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::Release);
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, error: &dyn fmt::Display) {
        let word = self.word.load(Ordering::Acquire);
        let failures = self.failure_count.fetch_add(1, Ordering::AcqRel).saturating_add(1);

        match unpack(word).0 {
            CircuitState::HalfOpen => {
                let now = self.clock.now_millis();
                if self
                    .word
                    .compare_exchange(
                        word,
                        pack(CircuitState::Open, now),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    tracing::warn!(failures, %error, "Circuit breaker: probe failed → open");
                }
            }
            CircuitState::Closed => {
                if failures >= self.failure_threshold {
                    let now = self.clock.now_millis();
                    if self
                        .word
                        .compare_exchange(
                            word,
                            pack(CircuitState::Open, now),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        tracing::error!(
                            failures,
                            threshold = self.failure_threshold,
                            %error,
                            "Circuit breaker → open"
                        );
                    }
                } else {
                    tracing::warn!(failures, threshold = self.failure_threshold, %error, "Primary failed");
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        unpack(self.word.load(Ordering::Acquire)).0
    }

    /// Consecutive failures observed since the last success or reset.
    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Acquire)
    }

    /// Time since the circuit last opened; `None` while closed.
    pub fn time_since_opened(&self) -> Option<Duration> {
        let (state, opened_at) = unpack(self.word.load(Ordering::Acquire));
        (state != CircuitState::Closed).then(|| {
            Duration::from_millis(self.clock.now_millis().saturating_sub(opened_at))
        })
    }

    /// Time until a probe is allowed; `None` unless open.
    pub fn time_until_half_open(&self) -> Option<Duration> {
        let (state, opened_at) = unpack(self.word.load(Ordering::Acquire));
        (state == CircuitState::Open).then(|| {
            let elapsed = self.clock.now_millis().saturating_sub(opened_at);
            Duration::from_millis(self.timeout_ms.saturating_sub(elapsed))
        })
    }

    /// Whether calls currently reach the primary.
    pub fn is_allowing_requests(&self) -> bool {
        self.state() != CircuitState::Open
    }

    /// Snapshot for status endpoints.
    pub fn status(&self) -> BreakerStatus {
        let (state, opened_at) = unpack(self.word.load(Ordering::Acquire));
        let elapsed = self.clock.now_millis().saturating_sub(opened_at);

        BreakerStatus {
            state,
            failure_count: self.failure_count(),
            failure_threshold: self.failure_threshold,
            timeout_ms: self.timeout_ms,
            allowing_requests: state != CircuitState::Open,
            time_in_open_ms: (state != CircuitState::Closed).then_some(elapsed),
            time_until_retry_ms: (state == CircuitState::Open)
                .then(|| self.timeout_ms.saturating_sub(elapsed)),
        }
    }

    /// Force the circuit closed and zero the failure count.
    pub fn reset(&self) {
        self.word.store(CLOSED_WORD, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        tracing::info!("Circuit breaker manually reset → closed");
    }
}
