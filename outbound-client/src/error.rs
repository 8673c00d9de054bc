//! Error types for the outbound pipeline.
//!
//! Three families are kept apart:
//!
//! - [`ConfigError`] is only ever returned while a client is being built.
//! - [`Error`] is the failure of a single call through the pipeline.
//! - [`BreakerError`] is returned by breaker-guarded dispatch and carries the
//!   real response when a status code tripped the breaker.

use std::time::Duration;
use thiserror::Error;

use crate::Response;

/// Result type for pipeline calls.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by a call through the pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// The overall call deadline elapsed before a final outcome.
    #[error("Request deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    /// The call was cancelled through its context.
    #[error("Request cancelled")]
    Cancelled,

    /// A single phase of the exchange timed out (for example response headers).
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Connection-level failure reported by a transport.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The request body could not be read.
    #[error("Failed to read request body: {0}")]
    Body(#[source] std::io::Error),

    /// The response headers exceeded the configured size limit.
    #[error("Response headers too large: {size} bytes exceeds limit of {limit} bytes")]
    ResponseHeadersTooLarge {
        /// Observed header size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// An in-chain circuit breaker is open.
    #[error("Circuit breaker '{name}' is open, request rejected")]
    CircuitOpen {
        /// Breaker name.
        name: String,
    },

    /// An in-chain circuit breaker is half-open and already has its trial calls in flight.
    #[error("Circuit breaker '{name}' is half-open, too many requests")]
    TooManyRequests {
        /// Breaker name.
        name: String,
    },

    /// The response carried an error status (see [`Response::error_for_status`]).
    #[error("Response error: {0}")]
    Status(http::StatusCode),

    /// Invalid URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Invalid header supplied on a request.
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(String),

    /// The response body was not valid UTF-8.
    #[error("Response body is not valid UTF-8: {0}")]
    Decode(#[source] std::string::FromUtf8Error),

    /// Underlying HTTP client error.
    #[error("HTTP error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl Error {
    /// Check if this is a timeout of any kind (phase timeout, deadline, or transport timeout).
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::DeadlineExceeded(_))
            || matches!(self, Self::Transport(e) if e.is_timeout())
    }

    /// Check if this is a connection error.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_)) || matches!(self, Self::Transport(e) if e.is_connect())
    }

    /// Check if the call was cancelled or ran out of time.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded(_))
    }
}

/// Errors detected while validating configuration and assembling a client.
///
/// None of these can occur once a client has been built.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// The overall timeout must be positive.
    #[error("timeout must be greater than 0, got: {0:?}")]
    InvalidTimeout(Duration),

    /// The initial retry interval must be positive.
    #[error("initial interval must be > 0, got: {0:?}")]
    InvalidInitialInterval(Duration),

    /// The max retry interval must not be smaller than the initial one.
    #[error("max interval ({max:?}) must be >= initial interval ({initial:?})")]
    MaxIntervalBelowInitial {
        /// Configured max interval.
        max: Duration,
        /// Configured initial interval.
        initial: Duration,
    },

    /// Backoff must never shrink.
    #[error("multiplier must be >= 1.0, got: {0}")]
    InvalidMultiplier(f64),

    /// At least one status code must be retriable when retries are configured.
    #[error("retriable status codes must not be empty")]
    EmptyRetriableStatusCodes,

    /// A retriable status code outside the valid HTTP range.
    #[error("invalid retriable status code: {0}")]
    InvalidStatusCode(u16),

    /// The sum of all backoff waits would not fit inside the overall timeout.
    #[error(
        "worst case retry backoff ({worst_case:?}) must be less than client timeout ({timeout:?}). \
         reduce max retries/max interval or increase client timeout"
    )]
    BackoffExceedsTimeout {
        /// Sum of all capped backoff steps.
        worst_case: Duration,
        /// Overall call timeout.
        timeout: Duration,
    },

    /// A configured header name is not a valid HTTP header name.
    #[error("invalid header name: {0:?}")]
    InvalidHeaderName(String),

    /// A configured static header value is not a valid HTTP header value.
    #[error("invalid value for header {name:?}")]
    InvalidHeaderValue {
        /// Header the value belongs to.
        name: String,
    },

    /// The connection pool could not be built.
    #[error("failed to build transport: {0}")]
    Transport(String),
}

/// Errors from breaker-guarded dispatch of an HTTP-shaped operation.
#[derive(Debug, Error)]
pub enum BreakerError {
    /// The breaker is open; the operation was not attempted.
    #[error("circuit breaker '{name}' is open")]
    Open {
        /// Breaker name.
        name: String,
    },

    /// The breaker is half-open and its trial budget is in use; the operation was not attempted.
    #[error("circuit breaker '{name}' is half-open, too many requests")]
    TooManyRequests {
        /// Breaker name.
        name: String,
    },

    /// The operation returned a response whose status trips the breaker.
    ///
    /// The real response is kept so the caller can still inspect it.
    #[error("server error: bad response status {}", response.status())]
    BadResponse {
        /// The response that was counted as a failure.
        response: Box<Response>,
    },

    /// The operation itself failed.
    #[error(transparent)]
    Request(#[from] Error),
}

impl BreakerError {
    /// Check whether the breaker refused to run the operation.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. } | Self::TooManyRequests { .. })
    }

    /// Check whether this is the trip marker for a bad response.
    pub fn is_bad_response(&self) -> bool {
        matches!(self, Self::BadResponse { .. })
    }

    /// Borrow the response that tripped the breaker, if any.
    pub fn bad_response(&self) -> Option<&Response> {
        match self {
            Self::BadResponse { response } => Some(response),
            _ => None,
        }
    }

    /// Take the response that tripped the breaker, if any.
    pub fn into_bad_response(self) -> Option<Response> {
        match self {
            Self::BadResponse { response } => Some(*response),
            _ => None,
        }
    }
}
