use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Application-wide error types for Levy.
#[derive(Error, Debug)]
pub enum AppError {
    /// Connection-level failure talking to a remote site.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// A single network attempt exceeded its deadline.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The remote site asked us to slow down (HTTP 429 or equivalent).
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// The response arrived but the expected fields could not be found.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Caller-supplied input is invalid.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Missing or invalid configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The remote site refused our credentials.
    #[error("Authentication error: {0}")]
    AuthenticationError(String),

    /// No pooled resource became available before the acquire deadline.
    #[error("Resource pool exhausted after waiting {waited:?} (capacity {capacity})")]
    PoolExhausted { capacity: usize, waited: Duration },

    /// The pool has been closed and hands out nothing.
    #[error("Resource pool is closed")]
    PoolClosed,

    /// The circuit breaker for an endpoint rejected the call.
    #[error("Circuit breaker '{key}' is open, retry after {}s", retry_after.as_secs())]
    CircuitOpen { key: String, retry_after: Duration },

    /// No strategy is registered for the jurisdiction.
    #[error("Unsupported jurisdiction: {0}")]
    UnsupportedJurisdiction(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// A job state change that the state machine does not allow.
    #[error("Invalid job transition for {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: crate::job::JobStatus,
        to: crate::job::JobStatus,
    },

    /// Backing store operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

/// Fieldless classification of an [`AppError`], used by the retry policy
/// and recorded on failed outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Timeout,
    RateLimit,
    Parse,
    Validation,
    Configuration,
    Authentication,
    PoolExhausted,
    CircuitOpen,
    Unsupported,
    Database,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Parse => "parse",
            ErrorKind::Validation => "validation",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Authentication => "authentication",
            ErrorKind::PoolExhausted => "pool_exhausted",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Database => "database",
            ErrorKind::Internal => "internal",
        }
    }

    /// Kinds that abort a retry sequence no matter how many attempts remain.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorKind::Validation
                | ErrorKind::Configuration
                | ErrorKind::Authentication
                | ErrorKind::CircuitOpen
                | ErrorKind::Unsupported
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::NetworkError(_) => ErrorKind::Network,
            AppError::Timeout(_) => ErrorKind::Timeout,
            AppError::RateLimited(_) => ErrorKind::RateLimit,
            AppError::ParseError(_) => ErrorKind::Parse,
            AppError::ValidationError(_)
            | AppError::JobNotFound(_)
            | AppError::InvalidTransition { .. } => ErrorKind::Validation,
            AppError::ConfigError(_) | AppError::PoolClosed => ErrorKind::Configuration,
            AppError::AuthenticationError(_) => ErrorKind::Authentication,
            AppError::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            AppError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            AppError::UnsupportedJurisdiction(_) => ErrorKind::Unsupported,
            AppError::DatabaseError(_) => ErrorKind::Database,
            AppError::SerializationError(_) | AppError::Generic(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if this error is transient and worth retrying.
    ///
    /// Parse errors are retryable here; the retry policy caps them to a
    /// smaller number of attempts.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Network
                | ErrorKind::Timeout
                | ErrorKind::RateLimit
                | ErrorKind::Parse
                | ErrorKind::PoolExhausted
        )
    }

    /// Returns true if this error should count against the endpoint's
    /// circuit breaker.
    pub fn should_trip_circuit(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::RateLimit
        )
    }
}
