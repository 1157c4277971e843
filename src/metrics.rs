//! Per-decision metrics hook.
//!
//! Aggregation and reporting belong to the caller; the limiter only reports
//! each decision to a [`MetricsSink`].

use std::time::Duration;

use crate::error::MetricsError;

/// Receives one record per rate limit decision.
///
/// Errors are logged by the limiter and otherwise ignored. A panicking sink
/// is caught and logged the same way, so a failing sink never changes a
/// decision that has already been made.
pub trait MetricsSink: Send + Sync {
    /// Record a decision for `identity` that took `response_time`.
    fn record(
        &self,
        identity: &str,
        allowed: bool,
        response_time: Duration,
    ) -> Result<(), MetricsError>;
}

/// Sink that discards every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _identity: &str, _allowed: bool, _response_time: Duration) -> Result<(), MetricsError> {
        Ok(())
    }
}

impl<F> MetricsSink for F
where
    F: Fn(&str, bool, Duration) -> Result<(), MetricsError> + Send + Sync,
{
    fn record(&self, identity: &str, allowed: bool, response_time: Duration) -> Result<(), MetricsError> {
        self(identity, allowed, response_time)
    }
}
