//! Fixed-size worker pool fed through a shared bounded queue
//!
//! Every worker loops: take the next job from the shared queue, run it to completion,
//! then pause for `inter_delay` before taking another. The pause paces each worker
//! independently, so `concurrency` workers give at most `concurrency / inter_delay`
//! jobs per second toward the downstream service.
//!
//! The receiving half of the queue is shared behind an async mutex that is held only
//! while waiting for the next job, so each job is delivered to exactly one worker.

use crate::error::{Error, Result};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// A unit of work executed by one worker
pub type Job = BoxFuture<'static, ()>;

/// Handle for submitting jobs to a [`WorkerPool`]
#[derive(Clone, Debug)]
pub struct WorkSink {
    sender: mpsc::Sender<Job>,
}

impl WorkSink {
    /// Queue a job, waiting while the queue is full
    ///
    /// Fails with [`Error::WorkerPoolClosed`] once every worker has stopped.
    pub async fn submit<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.sender
            .send(Box::pin(job))
            .await
            .map_err(|_| Error::WorkerPoolClosed)
    }
}

/// Fixed set of long-lived workers draining one shared queue
///
/// Dropping the pool aborts its workers.
pub struct WorkerPool {
    sender: Option<mpsc::Sender<Job>>,
    workers: JoinSet<()>,
    cancel: CancellationToken,
    concurrency: usize,
}

impl WorkerPool {
    /// Spawn `concurrency` workers sharing a queue of `queue_capacity` slots
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when `concurrency` or `queue_capacity` is zero; a pool
    /// without workers would never drain its queue.
    pub fn start(
        concurrency: usize,
        inter_delay: Duration,
        queue_capacity: usize,
        cancel: CancellationToken,
    ) -> Result<Self> {
        if concurrency == 0 {
            return Err(Error::config(
                "concurrency",
                "worker pool needs at least one worker",
            ));
        }
        if queue_capacity == 0 {
            return Err(Error::config(
                "queue_capacity",
                "worker pool queue needs at least one slot",
            ));
        }

        let (sender, receiver) = mpsc::channel::<Job>(queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = JoinSet::new();

        for worker_id in 0..concurrency {
            workers.spawn(run_worker(
                worker_id,
                Arc::clone(&receiver),
                inter_delay,
                cancel.clone(),
            ));
        }

        tracing::debug!(
            concurrency,
            queue_capacity,
            inter_delay_ms = inter_delay.as_millis(),
            "Worker pool started"
        );

        Ok(Self {
            sender: Some(sender),
            workers,
            cancel,
            concurrency,
        })
    }

    /// Number of workers in the pool
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Get a handle for submitting jobs
    ///
    /// Fails with [`Error::WorkerPoolClosed`] after [`close`](Self::close).
    pub fn sink(&self) -> Result<WorkSink> {
        self.sender
            .as_ref()
            .map(|sender| WorkSink {
                sender: sender.clone(),
            })
            .ok_or(Error::WorkerPoolClosed)
    }

    /// Stop accepting work from this handle
    ///
    /// Workers exit after draining the queue once every outstanding [`WorkSink`] is dropped.
    pub fn close(&mut self) {
        self.sender = None;
    }

    /// Stop workers without draining the queue
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Close the pool and wait for every worker to exit
    pub async fn shutdown(mut self) {
        self.close();
        while let Some(result) = self.workers.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker task failed");
            }
        }
        tracing::debug!(concurrency = self.concurrency, "Worker pool stopped");
    }
}

async fn run_worker(
    worker_id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    inter_delay: Duration,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = async { receiver.lock().await.recv().await } => job,
        };

        let Some(job) = job else {
            tracing::trace!(worker_id, "Work queue closed");
            break;
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = job => {}
        }

        if !inter_delay.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(inter_delay) => {}
            }
        }
    }
    tracing::trace!(worker_id, "Worker exiting");
}
