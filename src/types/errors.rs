//! Application error types.
//!
//! Two layers:
//! - [`Failure`] is what a wrapped backend call reports. It is a tagged union
//!   with one payload per category so retry classification is an exhaustive
//!   match.
//! - [`Error`] is what callers of this crate see. It preserves the backend
//!   failure (when there is one) so callers can tell rejection reasons apart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP status carried by rate-limit failures.
pub const RATE_LIMIT_STATUS: u16 = 429;

/// Category of a backend failure. Used in retry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Network,
    Api,
    RateLimit,
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureCategory::Network => "network",
            FailureCategory::Api => "api",
            FailureCategory::RateLimit => "rate_limit",
        };
        f.write_str(name)
    }
}

/// Transport-level cause of a network failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkErrorKind {
    Timeout,
    Connection,
    Dns,
    Unknown,
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkErrorKind::Timeout => "timeout",
            NetworkErrorKind::Connection => "connection",
            NetworkErrorKind::Dns => "dns",
            NetworkErrorKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Failure reported by a wrapped backend operation.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum Failure {
    /// The request never produced an HTTP response.
    #[error("network error ({kind}): {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
    },

    /// The backend answered with an error status.
    #[error("api error (status {status}): {message}")]
    Api {
        status: u16,
        code: Option<i64>,
        message: String,
    },

    /// The backend rejected the call for exceeding its quota.
    #[error("rate limited by backend{}", retry_after_suffix(.retry_after))]
    RateLimit {
        #[serde(default, with = "humantime_serde")]
        retry_after: Option<Duration>,
        limit: Option<u32>,
        remaining: Option<u32>,
        reset_at: Option<DateTime<Utc>>,
    },
}

fn retry_after_suffix(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(wait) => format!(", retry after {}ms", wait.as_millis()),
        None => String::new(),
    }
}

impl Failure {
    pub fn category(&self) -> FailureCategory {
        match self {
            Failure::Network { .. } => FailureCategory::Network,
            Failure::Api { .. } => FailureCategory::Api,
            Failure::RateLimit { .. } => FailureCategory::RateLimit,
        }
    }

    /// HTTP status associated with the failure, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Failure::Network { .. } => None,
            Failure::Api { status, .. } => Some(*status),
            Failure::RateLimit { .. } => Some(RATE_LIMIT_STATUS),
        }
    }

    /// Wait suggested by the backend before the next call.
    pub fn suggested_delay(&self) -> Option<Duration> {
        match self {
            Failure::RateLimit { retry_after, .. } => *retry_after,
            Failure::Network { .. } | Failure::Api { .. } => None,
        }
    }
}

// Convenience constructors
impl Failure {
    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        Self::Network {
            kind,
            message: message.into(),
        }
    }

    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            code: None,
            message: message.into(),
        }
    }

    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self::RateLimit {
            retry_after,
            limit: None,
            remaining: None,
            reset_at: None,
        }
    }
}

/// Main error enum for the guard layer.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration.
    #[error("validation error: {0}")]
    Validation(String),

    /// Admission queue is at capacity. Not retried by this layer.
    #[error("rate limiter queue full: {queued} waiting (max {max})")]
    QueueFull { queued: usize, max: usize },

    /// Caller cancelled the call while it was queued or retrying.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Caller-supplied deadline elapsed.
    #[error("timeout after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Backend failure that is not eligible for retry.
    #[error("backend failure: {0}")]
    Backend(Failure),

    /// Retry budget spent (attempts or total time).
    #[error("retries exhausted after {attempts} attempts in {}ms: {last}", .elapsed.as_millis())]
    RetriesExhausted {
        attempts: u32,
        elapsed: Duration,
        last: Failure,
    },

    /// Circuit breaker is open and rejected the call or its retry.
    #[error("circuit open after {attempts} attempts in {}ms", .elapsed.as_millis())]
    CircuitOpen {
        attempts: u32,
        elapsed: Duration,
        last: Option<Failure>,
    },

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Backend failure preserved by this error, if any.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Error::Backend(failure) => Some(failure),
            Error::RetriesExhausted { last, .. } => Some(last),
            Error::CircuitOpen { last, .. } => last.as_ref(),
            _ => None,
        }
    }

    /// Category of the preserved backend failure, if any.
    pub fn category(&self) -> Option<FailureCategory> {
        self.failure().map(Failure::category)
    }

    /// True for caller-initiated aborts (cancellation or deadline).
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled(_) | Error::Timeout(_))
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }
}
