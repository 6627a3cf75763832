//! Result aggregation under a global deadline
//!
//! The aggregator waits for one outcome per work item or for the batch deadline,
//! whichever comes first. Failures do not stop it early: every outcome is drained before
//! the batch is classified, so late successes or failures of other items are never
//! abandoned mid-batch.

use crate::config::FailurePolicy;
use crate::error::{BatchError, ItemFailure};
use crate::progress::ProgressObserver;
use crate::types::{BatchReport, ItemProgress, Outcome};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Stand-in deadline for timeouts too large to add to the clock
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Aggregator view of a running batch; lives only for one `collect` call
struct BatchState<T> {
    received: usize,
    expected: usize,
    started: Instant,
    deadline: Instant,
    records: Vec<T>,
    failures: Vec<ItemFailure>,
}

impl<T> BatchState<T> {
    fn new(expected: usize, timeout: Duration) -> Self {
        let started = Instant::now();
        Self {
            received: 0,
            expected,
            started,
            deadline: started
                .checked_add(timeout)
                .unwrap_or_else(|| started + FAR_FUTURE),
            records: Vec::with_capacity(expected),
            failures: Vec::new(),
        }
    }

    /// Record an outcome and return the progress snapshot for observers
    fn record(&mut self, outcome: Outcome<T>) -> ItemProgress {
        self.received += 1;
        let (identifier, succeeded) = match outcome {
            Outcome::Success { identifier, record } => {
                self.records.push(record);
                (identifier, true)
            }
            Outcome::Failure(failure) => {
                tracing::warn!(
                    index = failure.index,
                    identifier = %failure.identifier,
                    attempts = failure.attempts,
                    error = %failure.error,
                    "Identifier failed"
                );
                let identifier = failure.identifier.clone();
                self.failures.push(failure);
                (identifier, false)
            }
        };
        ItemProgress {
            identifier,
            succeeded,
            completed: self.received,
            total: self.expected,
        }
    }

    fn is_done(&self) -> bool {
        self.received >= self.expected
    }

    fn finish(self, policy: FailurePolicy) -> Result<BatchReport<T>, BatchError> {
        let elapsed = self.started.elapsed();
        if !self.failures.is_empty() && policy == FailurePolicy::FailFast {
            return Err(BatchError::PartialFailures {
                failures: self.failures,
                total: self.expected,
            });
        }
        Ok(BatchReport {
            records: self.records,
            failures: self.failures,
            elapsed,
        })
    }
}

/// Wait for `expected` outcomes or until `timeout` elapses
///
/// # Returns
///
/// - every record when all `expected` outcomes succeeded
/// - [`BatchError::PartialFailures`] when any outcome failed under [`FailurePolicy::FailFast`];
///   under [`FailurePolicy::BestEffort`] a report holding both records and failures
/// - [`BatchError::Timeout`] when the deadline fires first; outcomes arriving later are ignored
/// - [`BatchError::Incomplete`] when every sender is dropped before `expected` outcomes arrive
///
/// `expected == 0` returns an empty report without waiting.
pub async fn collect<T>(
    outcomes: &mut mpsc::Receiver<Outcome<T>>,
    expected: usize,
    timeout: Duration,
    policy: FailurePolicy,
    progress: &dyn ProgressObserver,
) -> Result<BatchReport<T>, BatchError> {
    if expected == 0 {
        return Ok(BatchReport::empty());
    }

    let mut state = BatchState::new(expected, timeout);
    let deadline = tokio::time::sleep_until(state.deadline);
    tokio::pin!(deadline);

    while !state.is_done() {
        tokio::select! {
            outcome = outcomes.recv() => match outcome {
                Some(outcome) => {
                    let snapshot = state.record(outcome);
                    progress.on_outcome(&snapshot);
                }
                None => {
                    tracing::error!(
                        completed = state.received,
                        expected,
                        "Outcome channel closed before batch completed"
                    );
                    return Err(BatchError::Incomplete {
                        completed: state.received,
                        expected,
                    });
                }
            },
            _ = &mut deadline => {
                let elapsed = state.started.elapsed();
                tracing::warn!(
                    completed = state.received,
                    expected,
                    elapsed_ms = elapsed.as_millis(),
                    "Batch deadline reached"
                );
                return Err(BatchError::Timeout {
                    completed: state.received,
                    expected,
                    elapsed,
                });
            }
        }
    }

    state.finish(policy)
}
