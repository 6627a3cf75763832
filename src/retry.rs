//! Retry logic with linear backoff
//!
//! Each identifier gets a bounded number of attempts inside the worker that dequeued it.
//! After failed attempt `n` the worker sleeps `n * backoff_step` before the next try;
//! the last failure is returned without sleeping. Retries never re-enqueue the item.
//!
//! # Example
//!
//! ```no_run
//! use batch_fetch::retry::{IsRetryable, retry_with_backoff};
//! use batch_fetch::config::RetryConfig;
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{:?}", self)
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! # async fn example() {
//! let config = RetryConfig::default();
//! let cancel = CancellationToken::new();
//! let result = retry_with_backoff(&config, &cancel, || async {
//!     // Your operation here
//!     Ok::<_, MyError>(())
//! }).await;
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::Error;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Trait for errors that can be classified as retryable or not
///
/// Errors that may go away on another attempt should return `true` from
/// [`is_retryable`](IsRetryable::is_retryable). Errors blamed on the request itself
/// (not found, malformed URL) additionally report
/// [`is_client_error`](IsRetryable::is_client_error), which
/// [`RetryConfig::retry_client_errors`] can turn into an immediate failure.
pub trait IsRetryable {
    /// Returns true if the operation may be attempted again after this error
    fn is_retryable(&self) -> bool;

    /// Returns true if the error is a rejection of the request rather than a transient fault
    fn is_client_error(&self) -> bool {
        false
    }
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        // Retrieval is opaque: every failure gets another attempt unless the batch is over
        !matches!(self, Error::Cancelled)
    }

    fn is_client_error(&self) -> bool {
        match self {
            Error::Network(e) => e.is_builder() || e.is_redirect(),
            // 408 and 429 are throttling, not rejection
            Error::HttpStatus { status, .. } => {
                (400..500).contains(status) && *status != 408 && *status != 429
            }
            Error::InvalidUrl { .. } => true,
            _ => false,
        }
    }
}

fn should_retry<E: IsRetryable>(config: &RetryConfig, error: &E) -> bool {
    error.is_retryable() && (config.retry_client_errors || !error.is_client_error())
}

/// Final error of a retried operation
#[derive(Debug)]
pub struct Exhausted<E> {
    /// Attempts made, including the first
    pub attempts: u32,
    /// Error returned by the last attempt
    pub error: E,
    /// Set when cancellation interrupted a backoff sleep
    pub cancelled: bool,
}

/// Execute an async operation with linear backoff retry logic
///
/// # Arguments
///
/// * `config` - Retry configuration (max attempts, backoff step, cap, jitter)
/// * `cancel` - Token that interrupts backoff sleeps
/// * `operation` - Async closure that returns Result<T, E> where E implements IsRetryable
///
/// # Returns
///
/// Returns the first successful result, or the last error together with the number of
/// attempts once they are exhausted, a non-retryable error occurs, or `cancel` fires.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, Exhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempts = attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if should_retry(config, &e) && attempt < max_attempts => {
                let delay = config.delay_for_attempt(attempt);
                let delay = if config.jitter {
                    add_jitter(delay)
                } else {
                    delay
                };

                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        tracing::debug!(attempt = attempt, "Retry backoff cancelled");
                        return Err(Exhausted {
                            attempts: attempt,
                            error: e,
                            cancelled: true,
                        });
                    }
                }
            }
            Err(e) => {
                if should_retry(config, &e) {
                    tracing::error!(
                        error = %e,
                        attempts = attempt,
                        "Operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::error!(
                        error = %e,
                        attempts = attempt,
                        "Operation failed with non-retryable error"
                    );
                }
                return Err(Exhausted {
                    attempts: attempt,
                    error: e,
                    cancelled: false,
                });
            }
        }
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay.
/// This means the actual delay will be between `delay` and `2 * delay`.
/// Delays too large to scale are returned unchanged.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::try_from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor)).unwrap_or(delay)
}
