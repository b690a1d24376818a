//! Error types for bibscout-enrich
//!
//! Two layers:
//! - [`EnrichError`] aborts a whole run (store unavailable, bad configuration).
//! - [`FetchError`] belongs to one record's outbound call and is recorded on the
//!   record instead of aborting the batch. "Not found" is not an error; lookups
//!   return an outcome enum with an explicit `NotFound` variant.

use crate::services::retry_policy::{Classify, RetryClass};
use thiserror::Error;

/// Run-level error
#[derive(Debug, Error)]
pub enum EnrichError {
    /// Persistent store could not be read or written
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Configuration rejected at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Input rejected before LOADING
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Generic error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<bibscout_common::Error> for EnrichError {
    fn from(err: bibscout_common::Error) -> Self {
        use bibscout_common::Error;
        match err {
            Error::Config(msg) => EnrichError::Config(msg),
            Error::InvalidInput(msg) => EnrichError::InvalidInput(msg),
            other => EnrichError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for EnrichError {
    fn from(err: sqlx::Error) -> Self {
        EnrichError::StoreUnavailable(err.to_string())
    }
}

/// Result type for run-level operations
pub type EnrichResult<T> = Result<T, EnrichError>;

/// Per-record outbound call failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Timeout, connection reset, 5xx
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// Target asked us to slow down (429 / 503)
    #[error("Rate limited by target: {0}")]
    RateLimitedByTarget(String),

    /// Response could not be parsed
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Auth failure, malformed input, hard 4xx
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// Run cancellation observed while waiting
    #[error("Cancelled")]
    Cancelled,
}

impl FetchError {
    /// Map a non-success, non-404 HTTP status
    pub fn from_status(status: u16, context: &str) -> Self {
        match status {
            429 | 503 => FetchError::RateLimitedByTarget(format!("{} returned {}", context, status)),
            408 | 500..=599 => FetchError::TransientNetwork(format!("{} returned {}", context, status)),
            401 | 403 => FetchError::Fatal(format!("{} rejected credentials ({})", context, status)),
            _ => FetchError::Fatal(format!("{} returned {}", context, status)),
        }
    }

    /// Stable label stored in `last_error` prefixes and events
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::TransientNetwork(_) => "transient_network",
            FetchError::RateLimitedByTarget(_) => "rate_limited",
            FetchError::MalformedResponse(_) => "malformed_response",
            FetchError::Fatal(_) => "fatal",
            FetchError::Cancelled => "cancelled",
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            FetchError::MalformedResponse(err.to_string())
        } else if err.is_builder() {
            FetchError::Fatal(err.to_string())
        } else {
            FetchError::TransientNetwork(err.to_string())
        }
    }
}

impl Classify for FetchError {
    fn retry_class(&self) -> RetryClass {
        match self {
            FetchError::TransientNetwork(_) => RetryClass::Transient,
            FetchError::RateLimitedByTarget(_) => RetryClass::RateLimited,
            FetchError::MalformedResponse(_) => RetryClass::Malformed,
            FetchError::Fatal(_) | FetchError::Cancelled => RetryClass::Fatal,
        }
    }

    fn is_cancellation(&self) -> bool {
        matches!(self, FetchError::Cancelled)
    }
}
