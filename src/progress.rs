//! Progress observation hooks
//!
//! Observers are told about every outcome the aggregator receives. They run inline on the
//! aggregating task, so implementations must return quickly and must not block.

use crate::types::{Event, ItemProgress};
use tokio::sync::broadcast;

/// Receives one notification per completed work item
pub trait ProgressObserver: Send + Sync {
    /// Called after each outcome (success or failure) is recorded
    fn on_outcome(&self, progress: &ItemProgress);
}

/// Observer that ignores every notification
#[derive(Clone, Copy, Debug, Default)]
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn on_outcome(&self, _progress: &ItemProgress) {}
}

/// Forwards progress as [`Event::ItemCompleted`] to broadcast subscribers
impl ProgressObserver for broadcast::Sender<Event> {
    fn on_outcome(&self, progress: &ItemProgress) {
        // Nobody listening is fine
        self.send(Event::from(progress)).ok();
    }
}
