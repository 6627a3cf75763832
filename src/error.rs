//! Error types for batch-fetch
//!
//! Errors come in two layers:
//! - [`Error`] describes why a single retrieval attempt (or engine setup) failed
//! - [`BatchError`] is the terminal result of a whole batch that did not succeed
//!
//! Per-attempt errors are recovered locally by the retry policy. Only when every
//! attempt for an identifier fails does an [`ItemFailure`] reach the aggregator,
//! and only the batch-level kinds are surfaced to the caller.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for batch-fetch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for batch-fetch
///
/// Returned by retrievers for a single attempt and by engine setup code.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "concurrency")
        key: Option<String>,
    },

    /// Network error from the HTTP client
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Server answered with a non-success status code
    #[error("HTTP error: status code {status}, url: {url}")]
    HttpStatus {
        /// The URL that was requested
        url: String,
        /// The HTTP status code returned
        status: u16,
    },

    /// Identifier could not be parsed as a URL
    #[error("invalid URL {url}: {reason}")]
    InvalidUrl {
        /// The offending identifier
        url: String,
        /// Parser error message
        reason: String,
    },

    /// Retrieval failed for a reason reported by a custom retriever
    #[error("retrieval failed: {0}")]
    Retrieval(String),

    /// Work was interrupted because its batch was cancelled or timed out
    #[error("cancelled")]
    Cancelled,

    /// The worker pool stopped accepting work
    #[error("worker pool closed: not accepting new work")]
    WorkerPoolClosed,

    /// Shutdown in progress - not accepting new batches
    #[error("shutdown in progress: not accepting new batches")]
    ShuttingDown,

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a configuration error on a specific key
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }

    /// Machine-readable error code, stable across releases
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Network(_) => "network_error",
            Error::HttpStatus { .. } => "http_status",
            Error::InvalidUrl { .. } => "invalid_url",
            Error::Retrieval(_) => "retrieval_error",
            Error::Cancelled => "cancelled",
            Error::WorkerPoolClosed => "worker_pool_closed",
            Error::ShuttingDown => "shutting_down",
            Error::Other(_) => "other",
        }
    }
}

/// Final failure of one identifier after the retry policy gave up
#[derive(Debug)]
pub struct ItemFailure {
    /// Position of the identifier in the batch input; tells duplicates apart
    pub index: usize,
    /// The identifier that failed
    pub identifier: String,
    /// Number of attempts made before giving up
    pub attempts: u32,
    /// The error returned by the last attempt
    pub error: Error,
}

impl fmt::Display for ItemFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} attempt{}): {}",
            self.identifier,
            self.attempts,
            if self.attempts == 1 { "" } else { "s" },
            self.error
        )
    }
}

/// Terminal error of a batch
///
/// Only these kinds are surfaced from [`FetchEngine::fetch_batch`](crate::FetchEngine::fetch_batch).
#[derive(Debug, Error)]
pub enum BatchError {
    /// At least one identifier exhausted its retries.
    ///
    /// Carries every per-identifier failure; successes of the same batch are discarded.
    #[error("{} of {total} identifiers failed: [{}]", .failures.len(), join_failures(.failures))]
    PartialFailures {
        /// Every identifier that failed, in arrival order
        failures: Vec<ItemFailure>,
        /// Number of identifiers in the batch
        total: usize,
    },

    /// The global deadline fired before all outcomes arrived
    #[error("timeout fetching URLs: {completed} of {expected} completed after {elapsed:?}")]
    Timeout {
        /// Outcomes received before the deadline
        completed: usize,
        /// Outcomes the batch was waiting for
        expected: usize,
        /// Time spent waiting
        elapsed: Duration,
    },

    /// Every outcome producer went away before the batch completed
    #[error("batch ended early: {completed} of {expected} outcomes received")]
    Incomplete {
        /// Outcomes received before the channel closed
        completed: usize,
        /// Outcomes the batch was waiting for
        expected: usize,
    },

    /// The batch could not be started
    #[error("batch could not start: {0}")]
    Setup(#[from] Error),
}

impl BatchError {
    /// Per-identifier failures, empty for every kind except `PartialFailures`
    pub fn failures(&self) -> &[ItemFailure] {
        match self {
            BatchError::PartialFailures { failures, .. } => failures,
            _ => &[],
        }
    }

    /// True when the batch hit its global deadline
    pub fn is_timeout(&self) -> bool {
        matches!(self, BatchError::Timeout { .. })
    }
}

fn join_failures(failures: &[ItemFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
