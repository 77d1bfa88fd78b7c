//! Job workers.
//!
//! A [`Worker`] pulls jobs from one queue at a bounded concurrency and hands each
//! to a [`JobHandler`]. The worker owns the lifecycle around the handler: metrics,
//! heartbeat, completion and failure reporting.

mod email;
mod notification;
mod priority;
mod reminder;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventmail_common::{AppError, QueueMetrics};
use futures::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Semaphore, watch};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::collaborators::CollaboratorError;
use crate::heartbeat::Heartbeat;
use crate::job::Job;
use crate::provider::ProviderError;
use crate::queue::Queue;

pub use email::{EmailHandler, Mailer};
pub use notification::NotificationHandler;
pub use priority::PriorityHandler;
pub use reminder::ReminderHandler;

/// Default sleep between polls of an empty queue.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default heartbeat period while a job runs.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Why a job attempt failed.
#[derive(Debug, Error)]
pub enum JobError {
    /// The payload can never succeed.
    #[error("ValidationError: {0}")]
    Validation(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error("{0}")]
    Broker(String),
}

impl JobError {
    /// Whether retrying the job is pointless.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

impl From<validator::ValidationErrors> for JobError {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<AppError> for JobError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Validation(message) => Self::Validation(message),
            other => Self::Broker(other.to_string()),
        }
    }
}

/// Executes the side effect of one job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job. The returned value is stored as the job's result.
    async fn handle(&self, job: &Job) -> Result<Value, JobError>;
}

/// Pulls jobs from one queue and runs them.
pub struct Worker {
    queue: Queue,
    handler: Arc<dyn JobHandler>,
    concurrency: usize,
    poll_interval: Duration,
    heartbeat_interval: Duration,
    metrics: Arc<QueueMetrics>,
}

impl Worker {
    /// Worker with the queue's standard concurrency.
    #[must_use]
    pub fn new(queue: Queue, handler: Arc<dyn JobHandler>, metrics: Arc<QueueMetrics>) -> Self {
        Self {
            concurrency: queue.name().concurrency(),
            queue,
            handler,
            poll_interval: DEFAULT_POLL_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            metrics,
        }
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    #[must_use]
    pub const fn with_heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    #[must_use]
    pub const fn queue(&self) -> &Queue {
        &self.queue
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<QueueMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Run one claimed job to completion or failure.
    pub async fn process(&self, job: Job) {
        let queue = self.queue.name();
        self.metrics.record_started();
        info!(
            queue = %queue,
            job_id = %job.id,
            attempt = job.attempts_made,
            max_attempts = job.max_attempts(),
            "Processing job"
        );

        let result = {
            let _heartbeat =
                Heartbeat::start(self.queue.clone(), job.clone(), self.heartbeat_interval);
            AssertUnwindSafe(self.handler.handle(&job))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(JobError::Broker("job handler panicked".to_string())))
        };

        match result {
            Ok(value) => match self.queue.complete(&job, value).await {
                Ok(true) => {
                    self.metrics.record_completed();
                    info!(queue = %queue, job_id = %job.id, "Job completed");
                }
                Ok(false) => {
                    self.metrics.record_failed();
                    debug!(queue = %queue, job_id = %job.id, "Result discarded");
                }
                Err(e) => {
                    self.metrics.record_failed();
                    error!(queue = %queue, job_id = %job.id, error = %e, "Failed to record completion");
                }
            },
            Err(e) => {
                self.metrics.record_failed();
                let reason = e.to_string();
                if let Err(store_err) = self
                    .queue
                    .fail_attempt(&job, &reason, e.is_permanent())
                    .await
                {
                    error!(
                        queue = %queue,
                        job_id = %job.id,
                        error = %store_err,
                        job_error = %reason,
                        "Failed to record job failure"
                    );
                }
            }
        }
    }

    /// Pull and run jobs until `shutdown` flips, then wait for in-flight jobs.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let queue = self.queue.name();
        let concurrency = self.concurrency;
        let permits = Arc::new(Semaphore::new(concurrency));
        let worker = Arc::new(self);

        info!(queue = %queue, concurrency, "Worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            match worker.queue.fetch_next().await {
                Ok(Some(job)) => {
                    let worker = Arc::clone(&worker);
                    tokio::spawn(async move {
                        worker.process(job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        () = sleep(worker.poll_interval) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                Err(e) => {
                    drop(permit);
                    warn!(queue = %queue, error = %e, "Failed to fetch next job");
                    tokio::select! {
                        () = sleep(worker.poll_interval) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        debug!(queue = %queue, "Waiting for in-flight jobs");
        if let Ok(all) = permits.acquire_many(concurrency as u32).await {
            drop(all);
        }
        info!(queue = %queue, "Worker stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::job::{JobOptions, JobState};
    use crate::queue::QueueName;
    use crate::store::MemoryJobStore;
    use serde_json::json;

    struct Scripted {
        failures_before_success: u32,
        calls: AtomicU32,
        permanent: bool,
    }

    #[async_trait]
    impl JobHandler for Scripted {
        async fn handle(&self, _job: &Job) -> Result<Value, JobError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.permanent {
                return Err(JobError::Validation("missing receiver".into()));
            }
            if call < self.failures_before_success {
                return Err(JobError::Broker("flaky".into()));
            }
            Ok(json!({"ok": true}))
        }
    }

    struct Panicking;

    #[async_trait]
    impl JobHandler for Panicking {
        async fn handle(&self, _job: &Job) -> Result<Value, JobError> {
            panic!("boom");
        }
    }

    fn worker(handler: Arc<dyn JobHandler>) -> (Worker, Queue, Arc<QueueMetrics>) {
        let queue = Queue::new(QueueName::Email, Arc::new(MemoryJobStore::new()));
        let metrics = Arc::new(QueueMetrics::new());
        let worker = Worker::new(queue.clone(), handler, metrics.clone());
        (worker, queue, metrics)
    }

    #[tokio::test]
    async fn test_process_success_removes_job() {
        let handler = Arc::new(Scripted {
            failures_before_success: 0,
            calls: AtomicU32::new(0),
            permanent: false,
        });
        let (worker, queue, metrics) = worker(handler);
        queue.enqueue_raw(json!({}), &JobOptions::default()).await.unwrap();

        let job = queue.fetch_next().await.unwrap().unwrap();
        worker.process(job).await;

        assert_eq!(queue.get_counts().await.unwrap().total(), 0);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.completed_count, 1);
        assert_eq!(snapshot.active_count, 0);
    }

    /// Succeeds, but only after the job was taken away from this worker.
    struct Preempted {
        queue: Queue,
    }

    #[async_trait]
    impl JobHandler for Preempted {
        async fn handle(&self, job: &Job) -> Result<Value, JobError> {
            self.queue.force_fail(job, "reclaimed elsewhere").await.unwrap();
            Ok(json!({"ok": true}))
        }
    }

    #[tokio::test]
    async fn test_lost_job_is_not_counted_completed() {
        let queue = Queue::new(QueueName::Email, Arc::new(MemoryJobStore::new()));
        let metrics = Arc::new(QueueMetrics::new());
        let handler = Arc::new(Preempted {
            queue: queue.clone(),
        });
        let worker = Worker::new(queue.clone(), handler, metrics.clone());
        let id = queue.enqueue_raw(json!({}), &JobOptions::default()).await.unwrap();

        let job = queue.fetch_next().await.unwrap().unwrap();
        worker.process(job).await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.completed_count, 0);
        assert_eq!(snapshot.failed_count, 1);
        assert_eq!(snapshot.active_count, 0);
        assert_eq!(queue.get_job(&id).await.unwrap().unwrap().state, JobState::Waiting);
    }

    #[tokio::test]
    async fn test_validation_error_fails_fast() {
        let handler = Arc::new(Scripted {
            failures_before_success: 0,
            calls: AtomicU32::new(0),
            permanent: true,
        });
        let (worker, queue, metrics) = worker(handler);
        let id = queue.enqueue_raw(json!({}), &JobOptions::single_email()).await.unwrap();

        let job = queue.fetch_next().await.unwrap().unwrap();
        worker.process(job).await;

        let job = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts_made, 1);
        assert!(job.failed_reason.unwrap().starts_with("ValidationError"));
        assert_eq!(metrics.snapshot().failed_count, 1);
    }

    #[tokio::test]
    async fn test_attempts_exhausted_lands_in_failed() {
        let handler = Arc::new(Scripted {
            failures_before_success: 10,
            calls: AtomicU32::new(0),
            permanent: false,
        });
        let (worker, queue, _) = worker(handler);
        let options = JobOptions {
            backoff: crate::retry::Backoff::fixed(0),
            ..JobOptions::default().with_attempts(3)
        };
        let id = queue.enqueue_raw(json!({}), &options).await.unwrap();

        for _ in 0..3 {
            let job = queue.fetch_next().await.unwrap().unwrap();
            worker.process(job).await;
        }

        let job = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts_made, 3);
        assert!(queue.fetch_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_panicking_handler_is_recorded_as_failure() {
        let (worker, queue, metrics) = worker(Arc::new(Panicking));
        let id = queue.enqueue_raw(json!({}), &JobOptions::default()).await.unwrap();

        let job = queue.fetch_next().await.unwrap().unwrap();
        worker.process(job).await;

        let job = queue.get_job(&id).await.unwrap().unwrap();
        assert_ne!(job.state, JobState::Active);
        assert_eq!(metrics.snapshot().active_count, 0);
    }

    #[tokio::test]
    async fn test_run_drains_queue_and_stops() {
        let handler = Arc::new(Scripted {
            failures_before_success: 0,
            calls: AtomicU32::new(0),
            permanent: false,
        });
        let (worker, queue, metrics) = worker(handler.clone());
        let worker = worker.with_poll_interval(Duration::from_millis(10));
        for _ in 0..3 {
            queue.enqueue_raw(json!({}), &JobOptions::default()).await.unwrap();
        }

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(rx));
        while metrics.snapshot().completed_count < 3 {
            sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.get_counts().await.unwrap().total(), 0);
    }
}
