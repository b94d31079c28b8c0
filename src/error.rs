//! Error types for Harrier Monitor

use thiserror::Error;

/// Application-level errors.
///
/// The fetcher maps upstream failures onto `TransientUpstream` (retried
/// internally, surfaced only after retries are exhausted) and
/// `MalformedResponse` (never retried). Persistence and configuration
/// failures are the only fatal paths.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Network error, 429/5xx status, or timeout after retries were exhausted
    #[error("transient upstream failure: {0}")]
    TransientUpstream(String),

    /// JSON parse failure or schema mismatch in an upstream response
    #[error("malformed upstream response: {0}")]
    MalformedResponse(String),

    /// Durable store write/read failed
    #[error("persistence failure: {0}")]
    Persistence(#[from] sqlx::Error),

    /// Configuration error, unresolvable at startup
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl MonitorError {
    /// Whether the affected unit of work may succeed on a later cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, MonitorError::TransientUpstream(_))
    }
}

/// Result type alias for convenience
pub type MonitorResult<T> = Result<T, MonitorError>;
