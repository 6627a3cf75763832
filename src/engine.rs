//! Batch dispatcher: feeds identifiers to the worker pool and aggregates the outcomes
//!
//! One call to [`FetchEngine::fetch_batch`] is one batch:
//! 1. a worker pool is started under a batch-scoped cancellation token
//! 2. a feeder task submits one job per identifier, concurrently with aggregation, so a
//!    queue smaller than the batch never deadlocks against busy workers
//! 3. each job runs the retry policy around the retriever and reports one outcome
//! 4. the aggregator waits for every outcome or the global deadline
//! 5. the batch token is cancelled and the pool shut down, interrupting any work the
//!    batch no longer waits for

use crate::aggregator;
use crate::config::{FetchConfig, RetryConfig};
use crate::error::{BatchError, Error, ItemFailure, Result};
use crate::pool::{WorkSink, WorkerPool};
use crate::retriever::{HttpRetriever, Retriever};
use crate::retry::retry_with_backoff;
use crate::types::{BatchReport, Event, Outcome, WorkItem};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::{Stream, StreamExt, wrappers::BroadcastStream};
use tokio_util::sync::CancellationToken;

/// Capacity of the progress event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Concurrent fetch engine
///
/// Holds the configuration and a retriever shared read-only by every worker. Batches may
/// run concurrently on the same engine; each gets its own worker pool.
///
/// # Example
///
/// ```no_run
/// use batch_fetch::{FetchConfig, FetchEngine};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let engine = FetchEngine::http(FetchConfig::default())?;
/// let pages = engine
///     .fetch_all(["https://crt.sh/?id=1", "https://crt.sh/?id=2"])
///     .await?;
/// for page in pages {
///     println!("{} -> {} bytes", page.url, page.body.len());
/// }
/// # Ok(())
/// # }
/// ```
pub struct FetchEngine<R: Retriever> {
    config: FetchConfig,
    retriever: Arc<R>,
    event_tx: broadcast::Sender<Event>,
    shutdown: CancellationToken,
}

impl FetchEngine<HttpRetriever> {
    /// Engine that fetches URLs over HTTP using `config.http`
    pub fn http(config: FetchConfig) -> Result<Self> {
        let retriever = HttpRetriever::new(&config.http)?;
        Self::new(config, retriever)
    }
}

impl<R: Retriever> FetchEngine<R> {
    /// Create an engine, rejecting configurations that could never finish a batch
    pub fn new(config: FetchConfig, retriever: R) -> Result<Self> {
        Self::with_shared(config, Arc::new(retriever))
    }

    /// Create an engine around a retriever that is also used elsewhere
    pub fn with_shared(config: FetchConfig, retriever: Arc<R>) -> Result<Self> {
        config.validate()?;
        let (event_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            config,
            retriever,
            event_tx,
            shutdown: CancellationToken::new(),
        })
    }

    /// Get the current configuration
    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Subscribe to progress events
    ///
    /// Subscribers that fall behind lose events; batches are never slowed down.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Progress events as a stream, skipping over events lost to lag
    pub fn events(&self) -> impl Stream<Item = Event> + Send + use<R> {
        BroadcastStream::new(self.event_tx.subscribe()).filter_map(|result| match result {
            Ok(event) => Some(event),
            Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event subscriber lagged");
                None
            }
        })
    }

    /// Cancel every running batch and refuse new ones
    pub fn shutdown(&self) {
        tracing::info!("Fetch engine shutting down");
        self.shutdown.cancel();
    }

    /// Fetch every identifier and return only the records
    ///
    /// Records arrive in completion order, not input order.
    pub async fn fetch_all<I, S>(
        &self,
        identifiers: I,
    ) -> std::result::Result<Vec<R::Record>, BatchError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fetch_batch(identifiers).await.map(|report| report.records)
    }

    /// Fetch every identifier as one batch
    ///
    /// Duplicate identifiers are fetched independently. See
    /// [`aggregator::collect`](crate::aggregator::collect) for how the batch resolves.
    pub async fn fetch_batch<I, S>(
        &self,
        identifiers: I,
    ) -> std::result::Result<BatchReport<R::Record>, BatchError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown.into());
        }

        let items: Vec<WorkItem> = identifiers
            .into_iter()
            .enumerate()
            .map(|(index, identifier)| WorkItem {
                index,
                identifier: identifier.into(),
            })
            .collect();
        let total = items.len();

        self.event_tx.send(Event::BatchStarted { total }).ok();
        if total == 0 {
            self.emit_finished(&Ok(BatchReport::empty()));
            return Ok(BatchReport::empty());
        }

        tracing::info!(
            total,
            concurrency = self.config.concurrency,
            timeout_secs = self.config.global_timeout.as_secs(),
            "Starting batch"
        );

        let batch_token = self.shutdown.child_token();
        let pool = WorkerPool::start(
            self.config.concurrency,
            self.config.inter_delay,
            self.config.effective_queue_capacity(),
            batch_token.clone(),
        )?;
        let sink = pool.sink()?;

        // One slot per item so workers never wait on reporting
        let (outcome_tx, mut outcome_rx) = mpsc::channel(total);

        let feeder = tokio::spawn(feed(
            items,
            sink,
            outcome_tx,
            Arc::clone(&self.retriever),
            self.config.retry.clone(),
            batch_token.clone(),
        ));

        let result = aggregator::collect(
            &mut outcome_rx,
            total,
            self.config.global_timeout,
            self.config.failure_policy,
            &self.event_tx,
        )
        .await;

        // Interrupt whatever the batch no longer waits for
        batch_token.cancel();
        feeder.abort();
        pool.shutdown().await;

        self.emit_finished(&result);
        match &result {
            Ok(report) => tracing::info!(
                succeeded = report.records.len(),
                failed = report.failures.len(),
                elapsed_ms = report.elapsed.as_millis(),
                "Batch complete"
            ),
            Err(e) => tracing::warn!(error = %e, "Batch failed"),
        }
        result
    }

    fn emit_finished(&self, result: &std::result::Result<BatchReport<R::Record>, BatchError>) {
        let event = match result {
            Ok(report) => Event::BatchFinished {
                succeeded: report.records.len(),
                failed: report.failures.len(),
                timed_out: false,
            },
            Err(BatchError::PartialFailures { failures, total }) => Event::BatchFinished {
                succeeded: total.saturating_sub(failures.len()),
                failed: failures.len(),
                timed_out: false,
            },
            Err(e) => Event::BatchFinished {
                succeeded: 0,
                failed: 0,
                timed_out: e.is_timeout(),
            },
        };
        self.event_tx.send(event).ok();
    }
}

/// Submit one job per work item, stopping early if the batch is cancelled
async fn feed<R: Retriever>(
    items: Vec<WorkItem>,
    sink: WorkSink,
    outcome_tx: mpsc::Sender<Outcome<R::Record>>,
    retriever: Arc<R>,
    retry: RetryConfig,
    cancel: CancellationToken,
) {
    for item in items {
        let job = process_item(
            item,
            Arc::clone(&retriever),
            retry.clone(),
            outcome_tx.clone(),
            cancel.clone(),
        );

        let submitted = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            submitted = sink.submit(job) => submitted,
        };
        if let Err(e) = submitted {
            tracing::warn!(error = %e, "Stopped feeding work items");
            return;
        }
    }
}

/// Retrieve one work item with retries and report its outcome
async fn process_item<R: Retriever>(
    item: WorkItem,
    retriever: Arc<R>,
    retry: RetryConfig,
    outcome_tx: mpsc::Sender<Outcome<R::Record>>,
    cancel: CancellationToken,
) {
    let WorkItem { index, identifier } = item;
    tracing::debug!(index, identifier = %identifier, "Processing work item");

    let result = {
        let retriever = retriever.as_ref();
        let id = identifier.as_str();
        let attempt_cancel = &cancel;
        retry_with_backoff(&retry, &cancel, || async move {
            tokio::select! {
                biased;
                _ = attempt_cancel.cancelled() => Err(Error::Cancelled),
                result = retriever.retrieve(id) => result,
            }
        })
        .await
    };

    let outcome = match result {
        Ok(record) => Outcome::Success { identifier, record },
        Err(exhausted) => Outcome::Failure(ItemFailure {
            index,
            identifier,
            attempts: exhausted.attempts,
            error: if exhausted.cancelled {
                Error::Cancelled
            } else {
                exhausted.error
            },
        }),
    };

    // The aggregator is gone once the batch returned
    outcome_tx.send(outcome).await.ok();
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FailurePolicy;
    use crate::retriever::FnRetriever;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    /// Stub that fails each identifier a fixed number of times before succeeding
    struct ScriptedRetriever {
        failures_before_success: HashMap<String, usize>,
        calls: Mutex<HashMap<String, usize>>,
        delay: Duration,
    }

    impl ScriptedRetriever {
        fn new(failures: &[(&str, usize)]) -> Self {
            Self {
                failures_before_success: failures
                    .iter()
                    .map(|(id, n)| (id.to_string(), *n))
                    .collect(),
                calls: Mutex::new(HashMap::new()),
                delay: Duration::ZERO,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self, id: &str) -> usize {
            self.calls.lock().unwrap().get(id).copied().unwrap_or(0)
        }
    }

    #[async_trait::async_trait]
    impl Retriever for ScriptedRetriever {
        type Record = String;

        async fn retrieve(&self, identifier: &str) -> Result<String> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                let entry = calls.entry(identifier.to_string()).or_insert(0);
                *entry += 1;
                *entry
            };
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let fail_count = self
                .failures_before_success
                .get(identifier)
                .copied()
                .unwrap_or(0);
            if call <= fail_count {
                Err(Error::Retrieval(format!("{identifier} attempt {call} failed")))
            } else {
                Ok(identifier.to_string())
            }
        }
    }

    fn config(concurrency: usize, max_attempts: u32) -> FetchConfig {
        let mut config = FetchConfig {
            concurrency,
            global_timeout: Duration::from_secs(10),
            ..Default::default()
        };
        config.retry.max_attempts = max_attempts;
        config
    }

    #[tokio::test]
    async fn test_all_succeed_instantly() {
        let engine = FetchEngine::new(config(2, 3), ScriptedRetriever::new(&[])).unwrap();

        let start = std::time::Instant::now();
        let mut records = engine.fetch_all(["a", "b", "c"]).await.unwrap();
        records.sort();

        assert_eq!(records, vec!["a", "b", "c"]);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_failures_then_success_includes_backoff() {
        let retriever = Arc::new(ScriptedRetriever::new(&[("flaky", 2)]));
        let engine = FetchEngine::with_shared(config(2, 3), Arc::clone(&retriever)).unwrap();

        let start = Instant::now();
        let mut records = engine.fetch_all(["flaky", "steady"]).await.unwrap();
        records.sort();

        assert_eq!(records, vec!["flaky", "steady"]);
        assert_eq!(retriever.calls("flaky"), 3);
        assert_eq!(retriever.calls("steady"), 1);
        assert!(start.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_identifier_is_reported_after_max_attempts() {
        let retriever = Arc::new(ScriptedRetriever::new(&[("a", usize::MAX)]));
        let engine = FetchEngine::with_shared(config(2, 2), Arc::clone(&retriever)).unwrap();

        let err = engine.fetch_all(["a", "b"]).await.unwrap_err();

        match err {
            BatchError::PartialFailures { failures, total } => {
                assert_eq!(total, 2);
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].identifier, "a");
                assert_eq!(failures[0].attempts, 2);
                assert!(matches!(failures[0].error, Error::Retrieval(_)));
            }
            other => panic!("expected PartialFailures, got {other:?}"),
        }
        assert_eq!(retriever.calls("a"), 2);
    }

    /// Retriever that counts calls and always fails with the given error
    fn always_failing(
        calls: Arc<AtomicUsize>,
        error: fn() -> Error,
    ) -> FnRetriever<impl Fn(String) -> futures::future::Ready<Result<String>> + Send + Sync>
    {
        FnRetriever::new(move |_id: String| {
            calls.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Err(error()))
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_opaque_error_is_retried_max_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let retriever =
            always_failing(Arc::clone(&calls), || Error::Other("always fails".into()));
        let engine = FetchEngine::new(config(1, 3), retriever).unwrap();

        let err = engine.fetch_all(["a"]).await.unwrap_err();

        assert_eq!(err.failures().len(), 1);
        assert_eq!(err.failures()[0].attempts, 3);
        assert!(matches!(err.failures()[0].error, Error::Other(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_retried_max_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let retriever = always_failing(Arc::clone(&calls), || Error::HttpStatus {
            url: "a".into(),
            status: 404,
        });
        let engine = FetchEngine::new(config(1, 3), retriever).unwrap();

        let err = engine.fetch_all(["a"]).await.unwrap_err();

        assert_eq!(err.failures()[0].attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_fails_at_once_without_client_error_retries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let retriever = always_failing(Arc::clone(&calls), || Error::HttpStatus {
            url: "a".into(),
            status: 404,
        });
        let mut config = config(1, 3);
        config.retry.retry_client_errors = false;
        let engine = FetchEngine::new(config, retriever).unwrap();

        let err = engine.fetch_all(["a"]).await.unwrap_err();

        assert_eq!(err.failures()[0].attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_huge_global_timeout_is_accepted() {
        let mut config = config(2, 3);
        config.global_timeout = Duration::from_secs(u64::MAX);
        let engine = FetchEngine::new(config, ScriptedRetriever::new(&[])).unwrap();

        let records = engine.fetch_all(["a"]).await.unwrap();
        assert_eq!(records, vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_never_a_partial_success() {
        let retriever = ScriptedRetriever::new(&[]).with_delay(Duration::from_secs(30));
        let mut config = config(2, 3);
        config.global_timeout = Duration::from_secs(5);
        config.failure_policy = FailurePolicy::BestEffort;
        let engine = FetchEngine::new(config, retriever).unwrap();

        let start = Instant::now();
        let err = engine.fetch_batch(["a", "b", "c"]).await.unwrap_err();

        assert!(err.is_timeout(), "expected timeout, got {err:?}");
        assert!(start.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_single_worker_processes_everything() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let retriever = {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            FnRetriever::new(move |id: String| {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, Error>(id)
                }
            })
        };
        let engine = FetchEngine::new(config(1, 3), retriever).unwrap();

        let ids: Vec<String> = (0..10).map(|i| format!("id-{i}")).collect();
        let mut records = engine.fetch_all(ids.clone()).await.unwrap();
        records.sort();
        let mut expected = ids;
        expected.sort();

        assert_eq!(records, expected);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicates_are_independent_items() {
        let retriever = Arc::new(ScriptedRetriever::new(&[]));
        let engine = FetchEngine::with_shared(config(3, 3), Arc::clone(&retriever)).unwrap();

        let records = engine.fetch_all(["x", "x", "x"]).await.unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(retriever.calls("x"), 3);
    }

    #[tokio::test]
    async fn test_failed_duplicates_keep_their_input_position() {
        let engine = FetchEngine::new(
            config(2, 1),
            ScriptedRetriever::new(&[("x", usize::MAX)]),
        )
        .unwrap();

        let err = engine.fetch_all(["x", "ok", "x"]).await.unwrap_err();

        let mut positions: Vec<_> = err.failures().iter().map(|f| f.index).collect();
        positions.sort_unstable();
        assert_eq!(positions, vec![0, 2]);
        assert!(err.failures().iter().all(|f| f.identifier == "x"));
    }

    #[tokio::test]
    async fn test_empty_batch_returns_immediately() {
        let engine = FetchEngine::new(config(2, 3), ScriptedRetriever::new(&[])).unwrap();
        let report = engine.fetch_batch(Vec::<String>::new()).await.unwrap();
        assert!(report.records.is_empty());
        assert!(report.is_complete());
    }

    #[tokio::test]
    async fn test_zero_concurrency_rejected_at_construction() {
        let result = FetchEngine::new(config(0, 3), ScriptedRetriever::new(&[]));
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[tokio::test]
    async fn test_best_effort_returns_both_lists() {
        let mut config = config(2, 1);
        config.failure_policy = FailurePolicy::BestEffort;
        let engine =
            FetchEngine::new(config, ScriptedRetriever::new(&[("bad", usize::MAX)])).unwrap();

        let report = engine.fetch_batch(["good", "bad"]).await.unwrap();

        assert_eq!(report.records, vec!["good"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].identifier, "bad");
    }

    #[tokio::test]
    async fn test_same_classification_on_repeat() {
        let engine = FetchEngine::new(
            config(2, 1),
            FnRetriever::new(|id: String| async move {
                if id.starts_with("bad") {
                    Err(Error::Retrieval("no".into()))
                } else {
                    Ok(id)
                }
            }),
        )
        .unwrap();

        for _ in 0..2 {
            let err = engine
                .fetch_all(["ok-1", "bad-1", "ok-2", "bad-2"])
                .await
                .unwrap_err();
            let mut failed: Vec<_> = err
                .failures()
                .iter()
                .map(|f| f.identifier.clone())
                .collect();
            failed.sort();
            assert_eq!(failed, vec!["bad-1", "bad-2"]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_in_flight_work() {
        let finished = Arc::new(AtomicUsize::new(0));
        let retriever = {
            let finished = Arc::clone(&finished);
            FnRetriever::new(move |id: String| {
                let finished = Arc::clone(&finished);
                async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Error>(id)
                }
            })
        };
        let mut config = config(2, 3);
        config.global_timeout = Duration::from_secs(1);
        let engine = FetchEngine::new(config, retriever).unwrap();

        let err = engine.fetch_all(["a", "b"]).await.unwrap_err();
        assert!(err.is_timeout());

        // Abandoned work never completes after the batch returned
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_events_bracket_the_batch() {
        let engine = FetchEngine::new(config(2, 3), ScriptedRetriever::new(&[])).unwrap();
        let mut events = engine.subscribe();

        engine.fetch_all(["a", "b"]).await.unwrap();

        assert_eq!(events.recv().await.unwrap(), Event::BatchStarted { total: 2 });
        let mut completed = 0;
        loop {
            match events.recv().await.unwrap() {
                Event::ItemCompleted {
                    succeeded, total, ..
                } => {
                    assert!(succeeded);
                    assert_eq!(total, 2);
                    completed += 1;
                }
                Event::BatchFinished {
                    succeeded,
                    failed,
                    timed_out,
                } => {
                    assert_eq!((succeeded, failed, timed_out), (2, 0, false));
                    break;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(completed, 2);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_batches() {
        let engine = FetchEngine::new(config(2, 3), ScriptedRetriever::new(&[])).unwrap();
        engine.shutdown();

        let err = engine.fetch_all(["a"]).await.unwrap_err();
        assert!(matches!(err, BatchError::Setup(Error::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_queue_smaller_than_batch_does_not_deadlock() {
        let mut config = config(2, 3);
        config.queue_capacity = Some(1);
        let engine = FetchEngine::new(config, ScriptedRetriever::new(&[])).unwrap();

        let ids: Vec<String> = (0..50).map(|i| i.to_string()).collect();
        let records = engine.fetch_all(ids).await.unwrap();
        assert_eq!(records.len(), 50);
    }
}
