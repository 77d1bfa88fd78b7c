//! Named job queues.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use eventmail_common::{AppError, AppResult};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::job::{Job, JobCounts, JobOptions, JobState};
use crate::jobs::JobPayload;
use crate::store::{FailDisposition, JobStore};

/// Capacity of each queue's event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// The fixed set of lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    Email,
    PriorityEmail,
    ReminderScheduling,
    SlackNotification,
}

impl QueueName {
    pub const ALL: [Self; 4] = [
        Self::Email,
        Self::PriorityEmail,
        Self::ReminderScheduling,
        Self::SlackNotification,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::PriorityEmail => "priority-email",
            Self::ReminderScheduling => "reminder-scheduling",
            Self::SlackNotification => "slack-notification",
        }
    }

    /// Jobs a worker on this lane runs at once.
    #[must_use]
    pub const fn concurrency(&self) -> usize {
        match self {
            Self::Email => 1,
            Self::PriorityEmail => 2,
            Self::ReminderScheduling => 5,
            Self::SlackNotification => 3,
        }
    }

    /// Options used when a producer does not pass any.
    #[must_use]
    pub const fn default_options(&self) -> JobOptions {
        match self {
            Self::Email => JobOptions::standard_email(),
            Self::PriorityEmail => JobOptions::priority_email(),
            Self::ReminderScheduling => JobOptions::reminder(),
            Self::SlackNotification => JobOptions::notification(),
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" | "email-queue" => Ok(Self::Email),
            "priority-email" | "priority" => Ok(Self::PriorityEmail),
            "reminder-scheduling" | "reminder" => Ok(Self::ReminderScheduling),
            "slack-notification" | "slack" => Ok(Self::SlackNotification),
            other => Err(AppError::Validation(format!("unknown queue: {other}"))),
        }
    }
}

/// Lifecycle notifications published by a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Added { id: String },
    Active { id: String, attempt: u32 },
    Progress { id: String },
    Completed { id: String },
    /// Terminal failure.
    Failed { id: String, reason: String },
    /// A failed attempt that will run again.
    Retrying {
        id: String,
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
    /// An active job stopped sending heartbeats.
    Stalled { id: String },
    Cleaned { state: JobState, count: usize },
    Paused,
    Resumed,
}

/// Handle to one named queue. Cheap to clone.
#[derive(Clone)]
pub struct Queue {
    name: QueueName,
    store: Arc<dyn JobStore>,
    events: broadcast::Sender<QueueEvent>,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue").field("name", &self.name).finish()
    }
}

impl Queue {
    #[must_use]
    pub fn new(name: QueueName, store: Arc<dyn JobStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            name,
            store,
            events,
        }
    }

    #[must_use]
    pub const fn name(&self) -> QueueName {
        self.name
    }

    /// Subscribe to this queue's lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Enqueue one payload.
    pub async fn enqueue(&self, payload: &JobPayload, options: &JobOptions) -> AppResult<String> {
        self.enqueue_raw(payload.to_value()?, options).await
    }

    /// Enqueue an already-serialized payload, e.g. when re-queuing an existing job.
    pub async fn enqueue_raw(&self, data: Value, options: &JobOptions) -> AppResult<String> {
        let id = self.store.add(self.name.as_str(), data, options).await?;
        debug!(queue = %self.name, job_id = %id, priority = options.priority, "Job added");
        self.emit(QueueEvent::Added { id: id.clone() });
        Ok(id)
    }

    /// Enqueue every payload independently. One failure never stops the rest.
    pub async fn enqueue_batch(
        &self,
        payloads: &[JobPayload],
        options: &JobOptions,
    ) -> Vec<AppResult<String>> {
        let mut results = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let result = self.enqueue(payload, options).await;
            if let Err(e) = &result {
                warn!(queue = %self.name, kind = payload.kind(), error = %e, "Failed to enqueue batch item");
            }
            results.push(result);
        }
        results
    }

    pub async fn get_job(&self, id: &str) -> AppResult<Option<Job>> {
        self.store.get(self.name.as_str(), id).await
    }

    /// Jobs in any of `states`, concatenated in the order given.
    pub async fn get_jobs_by_state(
        &self,
        states: &[JobState],
        offset: usize,
        limit: usize,
    ) -> AppResult<Vec<Job>> {
        let window = offset.saturating_add(limit);
        let mut jobs = Vec::new();
        for state in states {
            jobs.extend(self.store.list(self.name.as_str(), *state, 0, window).await?);
            if jobs.len() >= window {
                break;
            }
        }
        Ok(jobs.into_iter().skip(offset).take(limit).collect())
    }

    pub async fn get_counts(&self) -> AppResult<JobCounts> {
        self.store.counts(self.name.as_str()).await
    }

    /// Remove jobs that have been in `state` for at least `older_than`.
    pub async fn clean(&self, older_than: Duration, state: JobState) -> AppResult<Vec<String>> {
        let removed = self
            .store
            .clean(self.name.as_str(), state, older_than.as_millis() as u64)
            .await?;
        if !removed.is_empty() {
            info!(queue = %self.name, %state, count = removed.len(), "Cleaned jobs");
            self.emit(QueueEvent::Cleaned {
                state,
                count: removed.len(),
            });
        }
        Ok(removed)
    }

    /// Stop handing out jobs. Enqueued jobs stay where they are.
    pub async fn pause(&self) -> AppResult<()> {
        self.store.set_paused(self.name.as_str(), true).await?;
        info!(queue = %self.name, "Queue paused");
        self.emit(QueueEvent::Paused);
        Ok(())
    }

    pub async fn resume(&self) -> AppResult<()> {
        self.store.set_paused(self.name.as_str(), false).await?;
        info!(queue = %self.name, "Queue resumed");
        self.emit(QueueEvent::Resumed);
        Ok(())
    }

    pub async fn is_paused(&self) -> AppResult<bool> {
        self.store.is_paused(self.name.as_str()).await
    }

    /// Claim the next job under a fresh lock token.
    pub async fn fetch_next(&self) -> AppResult<Option<Job>> {
        let token = Uuid::new_v4().to_string();
        let job = self.store.fetch_next(self.name.as_str(), &token).await?;
        if let Some(job) = &job {
            self.emit(QueueEvent::Active {
                id: job.id.clone(),
                attempt: job.attempts_made,
            });
        }
        Ok(job)
    }

    /// Refresh the heartbeat of a job this process owns.
    pub async fn heartbeat(&self, job: &Job) -> AppResult<bool> {
        let Some(token) = job.token.as_deref() else {
            return Ok(false);
        };
        let touched = self
            .store
            .heartbeat(self.name.as_str(), &job.id, token)
            .await?;
        if touched {
            self.emit(QueueEvent::Progress { id: job.id.clone() });
        }
        Ok(touched)
    }

    /// Complete a job this process owns.
    pub async fn complete(&self, job: &Job, return_value: Value) -> AppResult<bool> {
        let applied = self
            .store
            .complete(
                self.name.as_str(),
                &job.id,
                job.token.as_deref(),
                return_value,
                job.options.remove_on_complete,
            )
            .await?;
        if applied {
            self.emit(QueueEvent::Completed { id: job.id.clone() });
        } else {
            warn!(queue = %self.name, job_id = %job.id, "Completion ignored; job no longer owned by this worker");
        }
        Ok(applied)
    }

    /// Record a failed attempt of a job this process owns.
    ///
    /// Permanent failures and jobs out of attempts become terminal `failed`; anything
    /// else is scheduled again after the job's backoff.
    pub async fn fail_attempt(
        &self,
        job: &Job,
        reason: &str,
        permanent: bool,
    ) -> AppResult<Option<JobState>> {
        let disposition = if permanent || !job.has_attempts_left() {
            FailDisposition::Terminal
        } else {
            FailDisposition::Retry {
                delay_ms: job.options.backoff.delay_for_attempt(job.attempts_made).as_millis()
                    as u64,
            }
        };
        self.record_failure(job, job.token.as_deref(), reason, disposition)
            .await
    }

    /// Fail an active job regardless of owner. It goes straight back to `waiting`
    /// while attempts remain.
    pub async fn force_fail(&self, job: &Job, reason: &str) -> AppResult<Option<JobState>> {
        let disposition = if job.has_attempts_left() {
            FailDisposition::Retry { delay_ms: 0 }
        } else {
            FailDisposition::Terminal
        };
        self.record_failure(job, None, reason, disposition).await
    }

    async fn record_failure(
        &self,
        job: &Job,
        token: Option<&str>,
        reason: &str,
        disposition: FailDisposition,
    ) -> AppResult<Option<JobState>> {
        let next = self
            .store
            .fail(self.name.as_str(), &job.id, token, reason, disposition)
            .await?;

        match (next, disposition) {
            (Some(JobState::Failed), _) => {
                error!(
                    queue = %self.name,
                    job_id = %job.id,
                    attempt = job.attempts_made,
                    max_attempts = job.max_attempts(),
                    error = reason,
                    "Job failed permanently"
                );
                self.emit(QueueEvent::Failed {
                    id: job.id.clone(),
                    reason: reason.to_string(),
                });
            }
            (Some(_), FailDisposition::Retry { delay_ms }) => {
                warn!(
                    queue = %self.name,
                    job_id = %job.id,
                    attempt = job.attempts_made,
                    delay_ms,
                    error = reason,
                    "Job attempt failed; will retry"
                );
                self.emit(QueueEvent::Retrying {
                    id: job.id.clone(),
                    attempt: job.attempts_made,
                    delay_ms,
                    reason: reason.to_string(),
                });
            }
            _ => {
                debug!(queue = %self.name, job_id = %job.id, "Failure ignored; job is not active");
            }
        }

        Ok(next)
    }

    /// Complete a job regardless of owner, keeping it under `completed`.
    pub async fn force_complete(&self, id: &str, return_value: Value) -> AppResult<bool> {
        let applied = self
            .store
            .complete(self.name.as_str(), id, None, return_value, false)
            .await?;
        if applied {
            self.emit(QueueEvent::Completed { id: id.to_string() });
        }
        Ok(applied)
    }

    /// Move a `failed` job back to `waiting`.
    pub async fn retry_job(&self, id: &str) -> AppResult<bool> {
        self.store.retry(self.name.as_str(), id).await
    }

    pub async fn remove_job(&self, id: &str) -> AppResult<bool> {
        self.store.remove(self.name.as_str(), id).await
    }

    /// Move an `active` job directly back to `waiting`.
    pub async fn move_to_waiting(&self, id: &str) -> AppResult<bool> {
        self.store.move_active_to_waiting(self.name.as_str(), id).await
    }

    pub async fn clear_stats(&self) -> AppResult<u64> {
        self.store.clear_stats(self.name.as_str()).await
    }

    /// Publish a stall notification for an active job.
    pub fn report_stalled(&self, id: &str) {
        warn!(queue = %self.name, job_id = %id, "Job stalled");
        self.emit(QueueEvent::Stalled { id: id.to_string() });
    }
}

/// Flags active jobs whose heartbeat has gone quiet.
pub struct StallDetector {
    queue: Queue,
    lock_duration: Duration,
    check_interval: Duration,
}

impl StallDetector {
    #[must_use]
    pub const fn new(queue: Queue, lock_duration: Duration, check_interval: Duration) -> Self {
        Self {
            queue,
            lock_duration,
            check_interval,
        }
    }

    /// Scan active jobs once. Returns the ids reported as stalled.
    pub async fn check(&self) -> AppResult<Vec<String>> {
        let now = Utc::now();
        let active = self
            .queue
            .get_jobs_by_state(&[JobState::Active], 0, usize::MAX)
            .await?;

        let mut stalled = Vec::new();
        for job in active {
            let Some(quiet) = job.quiet_for(now) else {
                continue;
            };
            if quiet >= self.lock_duration {
                self.queue.report_stalled(&job.id);
                stalled.push(job.id);
            }
        }
        Ok(stalled)
    }

    /// Check on a fixed interval until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.check().await {
                        error!(queue = %self.queue.name(), error = %e, "Stall check failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!(queue = %self.queue.name(), "Stall detector stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::jobs::ReminderSchedulingRequest;
    use crate::store::MemoryJobStore;
    use serde_json::json;

    fn payload(n: u32) -> JobPayload {
        JobPayload::ReminderScheduling(ReminderSchedulingRequest {
            event_id: format!("ev{n}"),
            recipient_id: format!("u{n}"),
            is_proposer: false,
            is_maybe: false,
        })
    }

    #[test]
    fn test_queue_names() {
        for name in QueueName::ALL {
            assert_eq!(name.as_str().parse::<QueueName>().unwrap(), name);
        }
        assert_eq!(QueueName::Email.concurrency(), 1);
        assert_eq!(QueueName::PriorityEmail.concurrency(), 2);
        assert!("fax".parse::<QueueName>().is_err());
    }

    #[tokio::test]
    async fn test_enqueue_emits_added() {
        let queue = Queue::new(QueueName::ReminderScheduling, Arc::new(MemoryJobStore::new()));
        let mut events = queue.subscribe();

        let id = queue.enqueue(&payload(1), &JobOptions::reminder()).await.unwrap();
        assert_eq!(events.recv().await.unwrap(), QueueEvent::Added { id: id.clone() });

        let job = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.payload().unwrap(), payload(1));
    }

    #[tokio::test]
    async fn test_batch_continues_past_bad_item() {
        let queue = Queue::new(QueueName::Email, Arc::new(MemoryJobStore::new()));
        let results = queue
            .enqueue_batch(&[payload(1), payload(2)], &JobOptions::default().with_attempts(0))
            .await;
        assert!(results.iter().all(Result::is_err));

        let results = queue
            .enqueue_batch(&[payload(1), payload(2), payload(3)], &JobOptions::batch_email())
            .await;
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 3);
        assert_eq!(queue.get_counts().await.unwrap().waiting, 3);
    }

    #[tokio::test]
    async fn test_fail_attempt_uses_backoff_then_terminal() {
        let queue = Queue::new(QueueName::Email, Arc::new(MemoryJobStore::new()));
        let options = JobOptions::default().with_attempts(2);
        let id = queue.enqueue(&payload(1), &options).await.unwrap();

        let job = queue.fetch_next().await.unwrap().unwrap();
        let state = queue.fail_attempt(&job, "provider down", false).await.unwrap();
        assert_eq!(state, Some(JobState::Delayed));

        let job = queue.get_job(&id).await.unwrap().unwrap();
        let delay = (job.delay_until.unwrap() - Utc::now()).num_milliseconds();
        assert!(delay > 2000 && delay <= 3000);
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_retries() {
        let queue = Queue::new(QueueName::Email, Arc::new(MemoryJobStore::new()));
        let id = queue.enqueue(&payload(1), &JobOptions::single_email()).await.unwrap();

        let job = queue.fetch_next().await.unwrap().unwrap();
        let state = queue.fail_attempt(&job, "bad payload", true).await.unwrap();
        assert_eq!(state, Some(JobState::Failed));

        let job = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 1);
        assert_eq!(job.failed_reason.as_deref(), Some("bad payload"));
    }

    #[tokio::test]
    async fn test_get_jobs_by_state_windows_across_states() {
        let queue = Queue::new(QueueName::Email, Arc::new(MemoryJobStore::new()));
        for n in 0..4 {
            queue.enqueue(&payload(n), &JobOptions::default()).await.unwrap();
        }
        queue.fetch_next().await.unwrap();

        let all = queue
            .get_jobs_by_state(&[JobState::Active, JobState::Waiting], 0, 10)
            .await
            .unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].state, JobState::Active);

        let page = queue
            .get_jobs_by_state(&[JobState::Active, JobState::Waiting], 1, 2)
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert!(page.iter().all(|j| j.state == JobState::Waiting));
    }

    #[tokio::test]
    async fn test_stall_detector_flags_quiet_jobs() {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Queue::new(QueueName::Email, store.clone());
        let id = queue.enqueue(&payload(1), &JobOptions::default()).await.unwrap();
        queue.fetch_next().await.unwrap();
        let mut events = queue.subscribe();

        let detector = StallDetector::new(queue.clone(), Duration::from_secs(30), Duration::from_secs(1));
        assert!(detector.check().await.unwrap().is_empty());

        store
            .update_job("email", &id, |job| {
                job.progress_at = Some(Utc::now() - chrono::Duration::seconds(31));
            })
            .await;
        assert_eq!(detector.check().await.unwrap(), vec![id.clone()]);
        assert_eq!(events.recv().await.unwrap(), QueueEvent::Stalled { id });
    }

    #[tokio::test]
    async fn test_force_complete_keeps_record() {
        let queue = Queue::new(QueueName::Email, Arc::new(MemoryJobStore::new()));
        let id = queue.enqueue(&payload(1), &JobOptions::default()).await.unwrap();
        queue.fetch_next().await.unwrap();

        assert!(queue.force_complete(&id, json!({"forcedCompletion": true})).await.unwrap());
        let job = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.return_value, Some(json!({"forcedCompletion": true})));
    }
}
