//! Error types for rate limiting operations.
//!
//! Only backend failures ([`StorageError`], [`ConnectionError`]) are ever fed
//! into the circuit breaker. A denied request is not an error: it is a normal
//! [`RateLimitResult`](crate::RateLimitResult) with `allowed == false`.

use std::time::Duration;
use thiserror::Error;

/// Result type for rate limiting operations.
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Main error type for rate limiting operations.
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// Storage backend error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Connection error (e.g., Redis connection failed).
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

/// Storage-related errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Generic storage operation failed.
    #[error("{0}")]
    OperationFailed(String),

    /// Stored state could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An atomic script returned something other than `(allowed, value, reset)`.
    #[error("Malformed script reply: {0}")]
    MalformedReply(String),

    /// Connection pool exhausted.
    #[error("Connection pool exhausted")]
    PoolExhausted,
}

impl StorageError {
    /// Create a new operation failed error.
    pub fn operation_failed(message: impl Into<String>) -> Self {
        Self::OperationFailed(message.into())
    }
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid quota configuration.
    #[error("Invalid quota: {0}")]
    InvalidQuota(String),

    /// Unknown algorithm name.
    #[error("Invalid algorithm configuration: {0}")]
    InvalidAlgorithm(String),

    /// Invalid circuit breaker configuration.
    #[error("Invalid circuit breaker configuration: {0}")]
    InvalidBreaker(String),

    /// Invalid storage configuration.
    #[error("Invalid storage configuration: {0}")]
    InvalidStorage(String),
}

/// Connection-related errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Failed to connect.
    #[error("Failed to connect: {0}")]
    ConnectionFailed(String),

    /// Store call did not complete in time.
    #[error("Connection timeout after {0:?}")]
    Timeout(Duration),
}

/// Error reported by a [`MetricsSink`](crate::metrics::MetricsSink).
///
/// Never propagated past the orchestrator.
#[derive(Debug, Error)]
#[error("Metrics sink failed: {0}")]
pub struct MetricsError(pub String);
