//! Error types for threatscan
//!
//! This module defines the error taxonomy shared by the transport, the
//! retry executor, the pager, the upload builder and the scan service.
//! All error types use `thiserror` for ergonomic error handling.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// A non-success response from the API, with the server's diagnostic detail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    /// HTTP status code of the failed response
    pub status: u16,
    /// Machine-readable error code (e.g. `NotFoundError`), when the body carried one
    pub code: Option<String>,
    /// Human-readable message
    pub message: String,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "HTTP {} {}: {}", self.status, code, self.message),
            None => write!(f, "HTTP {}: {}", self.status, self.message),
        }
    }
}

/// A 429 response, carrying the server's backoff hints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitError {
    /// The underlying API error
    pub api: ApiError,
    /// Wait hint from the `Retry-After` header
    pub retry_after: Option<Duration>,
    /// Remaining request quota, when the server reported it
    pub remaining_quota: Option<i64>,
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.api)?;
        if let Some(wait) = self.retry_after {
            write!(f, " (retry after {}s)", wait.as_secs())?;
        }
        if let Some(quota) = self.remaining_quota {
            write!(f, " (remaining quota {})", quota)?;
        }
        Ok(())
    }
}

/// Argument validation errors, raised before any I/O
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArgumentError {
    /// A required argument was not supplied
    #[error("Missing required argument: {0}")]
    Missing(&'static str),

    /// The argument was supplied but is empty
    #[error("Argument must not be empty: {0}")]
    Empty(&'static str),

    /// The argument was supplied but is not acceptable
    #[error("Invalid argument {name}: {reason}")]
    Invalid {
        /// Argument name
        name: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

/// Client-level error type
///
/// This is the main error type returned by every client operation.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The API answered with a non-success status
    #[error("API error: {0}")]
    Api(ApiError),

    /// The API rejected the request because the quota was exceeded
    #[error("Rate limited: {0}")]
    RateLimited(RateLimitError),

    /// An argument was rejected before any I/O happened
    #[error("Invalid argument: {0}")]
    InvalidArgument(#[from] ArgumentError),

    /// The operation observed a cancellation signal
    #[error("Operation cancelled")]
    Cancelled,

    /// The operation did not finish within its wall-clock budget
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Request timed out at the transport level
    #[error("Network timeout")]
    NetworkTimeout,

    /// Generic network error
    #[error("Network error: {0}")]
    Network(String),

    /// The response body did not have the expected shape
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Local file I/O failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The filesystem watcher could not be set up
    #[error("Watch error: {0}")]
    Watch(String),
}

impl ClientError {
    /// Returns true if this error is the cancellation condition
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ClientError::Cancelled)
    }

    /// Returns the API error detail, for both plain and rate-limit failures
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            ClientError::Api(err) => Some(err),
            ClientError::RateLimited(err) => Some(&err.api),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::NetworkTimeout
        } else {
            ClientError::Network(err.to_string())
        }
    }
}

/// Trait for determining whether the retry executor may retry an error
///
/// Retries apply exclusively to the rate-limit condition; every other
/// failure is considered non-transient at this layer.
pub trait RetryableError {
    /// Returns true if the error is retryable
    fn is_retryable(&self) -> bool;

    /// Server-provided wait hint, if any
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl RetryableError for ClientError {
    fn is_retryable(&self) -> bool {
        matches!(self, ClientError::RateLimited(_))
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            ClientError::RateLimited(err) => err.retry_after,
            _ => None,
        }
    }
}

/// Validate a required string argument, distinguishing absent from empty
pub fn require_non_empty<'a>(
    value: Option<&'a str>,
    name: &'static str,
) -> Result<&'a str, ArgumentError> {
    match value {
        None => Err(ArgumentError::Missing(name)),
        Some(v) if v.trim().is_empty() => Err(ArgumentError::Empty(name)),
        Some(v) => Ok(v),
    }
}
