//! Core types and events

use crate::error::ItemFailure;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One unit of retrieval work
///
/// Created by the engine from the caller's identifiers and handed to exactly one worker.
/// Duplicate identifiers become separate work items with different indices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkItem {
    /// Position of the identifier in the caller's input
    pub index: usize,
    /// The identifier to retrieve (usually a URL)
    pub identifier: String,
}

/// Terminal result of processing one [`WorkItem`]
#[derive(Debug)]
pub enum Outcome<T> {
    /// Retrieval succeeded
    Success {
        /// The identifier that was retrieved
        identifier: String,
        /// The retrieved record
        record: T,
    },
    /// Every attempt failed
    Failure(ItemFailure),
}

impl<T> Outcome<T> {
    /// Identifier this outcome belongs to
    pub fn identifier(&self) -> &str {
        match self {
            Outcome::Success { identifier, .. } => identifier,
            Outcome::Failure(failure) => &failure.identifier,
        }
    }

    /// Returns true for `Success`
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }
}

/// Result of a completed batch
///
/// Records are in arrival order, which need not match input order.
#[derive(Debug)]
pub struct BatchReport<T> {
    /// Successfully retrieved records
    pub records: Vec<T>,
    /// Identifiers that failed (always empty under the fail-fast policy)
    pub failures: Vec<ItemFailure>,
    /// Wall time the batch took
    pub elapsed: Duration,
}

impl<T> BatchReport<T> {
    pub(crate) fn empty() -> Self {
        Self {
            records: Vec::new(),
            failures: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    /// True when every identifier succeeded
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Progress of one completed work item, passed to progress observers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemProgress {
    /// Identifier that just completed
    pub identifier: String,
    /// Whether it succeeded
    pub succeeded: bool,
    /// Outcomes received so far, including this one
    pub completed: usize,
    /// Outcomes the batch is waiting for
    pub total: usize,
}

/// Events emitted by the fetch engine
///
/// Subscribe with [`FetchEngine::subscribe`](crate::FetchEngine::subscribe). Events are
/// informational only; a slow or missing subscriber never affects a batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A batch was dispatched
    BatchStarted {
        /// Number of identifiers in the batch
        total: usize,
    },

    /// One identifier reached its terminal outcome
    ItemCompleted {
        /// The identifier
        identifier: String,
        /// Whether it succeeded
        succeeded: bool,
        /// Outcomes received so far
        completed: usize,
        /// Number of identifiers in the batch
        total: usize,
    },

    /// A batch returned to its caller
    BatchFinished {
        /// Records retrieved
        succeeded: usize,
        /// Identifiers that failed
        failed: usize,
        /// Whether the global deadline fired
        timed_out: bool,
    },
}

impl From<&ItemProgress> for Event {
    fn from(progress: &ItemProgress) -> Self {
        Event::ItemCompleted {
            identifier: progress.identifier.clone(),
            succeeded: progress.succeeded,
            completed: progress.completed,
            total: progress.total,
        }
    }
}
