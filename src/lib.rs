//! # batch-fetch
//!
//! Concurrent fetch engine: retrieves a list of identifiers (usually URLs) with bounded
//! parallelism, per-worker pacing, linear-backoff retries and a single global deadline.
//!
//! ## Design Philosophy
//!
//! - **Explicit configuration** - everything comes from a [`FetchConfig`], nothing from
//!   process-wide state
//! - **Fail fast by default** - one failed identifier fails the batch; switch to
//!   [`FailurePolicy::BestEffort`] to keep partial results
//! - **No leaked work** - when a batch returns (including on timeout) its in-flight
//!   retrievals are cancelled
//! - **Pluggable retrieval** - implement [`Retriever`] or wrap a closure in
//!   [`FnRetriever`]; [`HttpRetriever`] covers plain HTTP GETs
//!
//! ## Quick Start
//!
//! ```no_run
//! use batch_fetch::{FetchConfig, FetchEngine};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = FetchConfig {
//!         concurrency: 5,
//!         global_timeout: Duration::from_secs(600),
//!         ..Default::default()
//!     };
//!
//!     let engine = FetchEngine::http(config)?;
//!
//!     // Subscribe to progress events
//!     let mut events = engine.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let pages = engine
//!         .fetch_all(["https://crt.sh/?id=1", "https://crt.sh/?id=2"])
//!         .await?;
//!     println!("fetched {} pages", pages.len());
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Result aggregation under a global deadline
pub mod aggregator;
/// Configuration types
pub mod config;
/// Batch dispatcher and engine entry point
pub mod engine;
/// Error types
pub mod error;
/// Worker pool with a shared bounded queue
pub mod pool;
/// Progress observation hooks
pub mod progress;
/// Retrieval functions consumed by the engine
pub mod retriever;
/// Retry logic with linear backoff
pub mod retry;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use config::{FailurePolicy, FetchConfig, HttpConfig, RetryConfig};
pub use engine::FetchEngine;
pub use error::{BatchError, Error, ItemFailure, Result};
pub use progress::{NoProgress, ProgressObserver};
pub use retriever::{FetchedPage, FnRetriever, HttpRetriever, Retriever};
pub use types::{BatchReport, Event, ItemProgress, Outcome, WorkItem};
