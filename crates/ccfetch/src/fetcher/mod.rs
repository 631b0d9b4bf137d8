//! Ranged fetch backends
//!
//! Every backend satisfies [`RangeFetcher`]: fetch `length` bytes starting at
//! `start` from a named remote object, and say whether a failure is worth
//! retrying. [`retry::BackoffFetcher`] wraps any backend with the retry
//! state machine.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub mod http;
pub mod retry;
pub mod s3;

pub use http::HttpRangeFetcher;
pub use retry::BackoffFetcher;
pub use s3::S3RangeFetcher;

/// Failure of a single fetch attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Throttling, server errors, timeouts, short reads. Worth retrying.
    #[error("transient fetch failure: {0}")]
    Transient(String),

    /// Missing object, unsatisfiable range, malformed data. Retrying won't help.
    #[error("permanent fetch failure: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Capability: retrieve a byte range of a remote object.
#[async_trait]
pub trait RangeFetcher: Send + Sync {
    /// Fetch bytes `[start, start + length)` of `location`.
    async fn fetch_range(
        &self,
        location: &str,
        start: u64,
        length: u64,
    ) -> Result<Vec<u8>, FetchError>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

/// Position of one fetch in the retry state machine.
///
/// `Pending -> (Attempting -> Waiting)* -> Succeeded | FailedPermanent | FailedExhausted`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchState {
    Pending,
    Attempting { attempt: u32 },
    Waiting { attempt: u32, wait: Duration },
    Succeeded,
    FailedPermanent,
    FailedExhausted,
}

/// Why a fetch ended without a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    Permanent(FetchError),
    Exhausted(FetchError),
}

impl FetchFailure {
    pub fn error(&self) -> &FetchError {
        match self {
            FetchFailure::Permanent(e) | FetchFailure::Exhausted(e) => e,
        }
    }
}

/// Terminal result of a (possibly retried) fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Fetched { payload: Vec<u8>, attempts: u32 },
    Failed { failure: FetchFailure, attempts: u32 },
}

impl FetchOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            FetchOutcome::Fetched { attempts, .. } | FetchOutcome::Failed { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn state(&self) -> FetchState {
        match self {
            FetchOutcome::Fetched { .. } => FetchState::Succeeded,
            FetchOutcome::Failed {
                failure: FetchFailure::Permanent(_),
                ..
            } => FetchState::FailedPermanent,
            FetchOutcome::Failed {
                failure: FetchFailure::Exhausted(_),
                ..
            } => FetchState::FailedExhausted,
        }
    }
}

/// Classify an HTTP status code returned for a ranged read.
///
/// `None` for 2xx; the caller still has to check the body length.
pub(crate) fn classify_status(status: u16) -> Option<FetchError> {
    match status {
        200..=299 => None,
        408 | 429 => Some(FetchError::transient(format!("HTTP {} (throttled)", status))),
        500..=599 => Some(FetchError::transient(format!("HTTP {}", status))),
        _ => Some(FetchError::permanent(format!("HTTP {}", status))),
    }
}

/// Check that a backend returned exactly the requested range.
pub(crate) fn expect_length(payload: Vec<u8>, expected: u64) -> Result<Vec<u8>, FetchError> {
    let got = payload.len() as u64;
    if got == expected {
        Ok(payload)
    } else if got < expected {
        Err(FetchError::transient(format!(
            "short read: expected {} bytes, got {}",
            expected, got
        )))
    } else {
        Err(FetchError::permanent(format!(
            "malformed range response: expected {} bytes, got {}",
            expected, got
        )))
    }
}

/// Inclusive HTTP `Range` header value for `[start, start + length)`.
pub(crate) fn range_header(start: u64, length: u64) -> Result<String, FetchError> {
    if length == 0 {
        return Err(FetchError::permanent("empty byte range"));
    }
    let end = start
        .checked_add(length - 1)
        .ok_or_else(|| FetchError::permanent("byte range overflows"))?;
    Ok(format!("bytes={}-{}", start, end))
}
