//! Ghost-job reaper.
//!
//! A job can stay `active` forever when the process running it dies before reporting
//! back. The reaper reclaims such jobs on two triggers: shortly after the queue
//! publishes a stall notification, and on a fixed period as a second line of defense.
//!
//! A job is a ghost only when it is both old and silent. Long sends, such as a retry
//! sitting out a multi-minute rate-limit backoff, keep heartbeating and are left alone.

use std::time::Duration;

use chrono::{DateTime, Utc};
use eventmail_common::AppResult;
use eventmail_common::config::QueueSettings;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};
use tracing::{debug, error, info, warn};

use crate::job::{Job, JobCounts, JobState};
use crate::queue::{Queue, QueueEvent};

/// Reaper timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaperConfig {
    /// Active age after which a job is a ghost (default: 120 seconds).
    pub ghost_threshold: Duration,
    /// Wait after a stall notification before scanning (default: 5 seconds).
    pub stall_grace: Duration,
    /// Period of the sweep (default: 5 minutes).
    pub interval: Duration,
    /// A heartbeat within this window marks a job as alive (default: 30 seconds).
    pub lock_duration: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            ghost_threshold: Duration::from_millis(120_000),
            stall_grace: Duration::from_secs(5),
            interval: Duration::from_secs(300),
            lock_duration: Duration::from_secs(30),
        }
    }
}

impl From<&QueueSettings> for ReaperConfig {
    fn from(settings: &QueueSettings) -> Self {
        Self {
            ghost_threshold: Duration::from_millis(settings.ghost_threshold_ms),
            stall_grace: Duration::from_millis(settings.stall_grace_ms),
            interval: Duration::from_millis(settings.reaper_interval_ms),
            lock_duration: Duration::from_millis(settings.lock_duration_ms),
        }
    }
}

/// Result of one periodic sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub before: JobCounts,
    pub after: JobCounts,
    /// Ghosts moved back to `waiting` or into `failed`.
    pub reclaimed: Vec<String>,
    /// Stale active jobs removed by the clean pass.
    pub removed: Vec<String>,
}

pub struct Reaper {
    queue: Queue,
    config: ReaperConfig,
}

impl Reaper {
    #[must_use]
    pub const fn new(queue: Queue, config: ReaperConfig) -> Self {
        Self { queue, config }
    }

    /// Active age of `job` when it is a ghost: past the ghost threshold and without
    /// a heartbeat for a full lock duration.
    fn ghost_age(&self, job: &Job, now: DateTime<Utc>) -> Option<Duration> {
        let age = job.active_for(now)?;
        if age < self.config.ghost_threshold {
            return None;
        }
        let quiet = job.quiet_for(now)?;
        if quiet < self.config.lock_duration {
            debug!(
                queue = %self.queue.name(),
                job_id = %job.id,
                active_ms = age.as_millis() as u64,
                quiet_ms = quiet.as_millis() as u64,
                "Long-running job is still heartbeating"
            );
            return None;
        }
        Some(age)
    }

    async fn ghosts(&self) -> AppResult<Vec<(Job, Duration)>> {
        let now = Utc::now();
        let active = self
            .queue
            .get_jobs_by_state(&[JobState::Active], 0, usize::MAX)
            .await?;
        Ok(active
            .into_iter()
            .filter_map(|job| self.ghost_age(&job, now).map(|age| (job, age)))
            .collect())
    }

    /// Force-fail every ghost job.
    ///
    /// Ghosts with attempts left go back to `waiting`; the rest end in `failed`.
    pub async fn reclaim_ghosts(&self) -> AppResult<Vec<String>> {
        let threshold_ms = self.config.ghost_threshold.as_millis() as u64;

        let mut reclaimed = Vec::new();
        for (job, age) in self.ghosts().await? {
            let reason = format!(
                "GhostJobError: active for {}ms, exceeding {threshold_ms}ms",
                age.as_millis()
            );
            match self.queue.force_fail(&job, &reason).await? {
                Some(state) => {
                    warn!(
                        queue = %self.queue.name(),
                        job_id = %job.id,
                        attempt = job.attempts_made,
                        next_state = %state,
                        "Reclaimed ghost job"
                    );
                    reclaimed.push(job.id);
                }
                None => {
                    info!(queue = %self.queue.name(), job_id = %job.id, "Ghost job finished before reclaim");
                }
            }
        }

        Ok(reclaimed)
    }

    /// Periodic pass: reclaim ghosts, then remove any ghost still left in `active`.
    pub async fn sweep(&self) -> AppResult<SweepReport> {
        let before = self.queue.get_counts().await?;
        if before.active == 0 {
            return Ok(SweepReport {
                before,
                after: before,
                ..SweepReport::default()
            });
        }

        info!(queue = %self.queue.name(), counts = %before, "Sweeping active jobs");

        let reclaimed = self.reclaim_ghosts().await?;
        let mut removed = Vec::new();
        for (job, _) in self.ghosts().await? {
            if self.queue.remove_job(&job.id).await? {
                error!(queue = %self.queue.name(), job_id = %job.id, "Removed unrecoverable ghost job");
                removed.push(job.id);
            }
        }

        let after = self.queue.get_counts().await?;
        info!(
            queue = %self.queue.name(),
            reclaimed = reclaimed.len(),
            removed = removed.len(),
            before = %before,
            after = %after,
            "Sweep finished"
        );

        Ok(SweepReport {
            before,
            after,
            reclaimed,
            removed,
        })
    }

    /// React to stall notifications and sweep on the configured period until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.queue.subscribe();
        let mut ticker = interval_at(Instant::now() + self.config.interval, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            queue = %self.queue.name(),
            ghost_threshold_ms = self.config.ghost_threshold.as_millis() as u64,
            interval_secs = self.config.interval.as_secs(),
            "Reaper started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(queue = %self.queue.name(), error = %e, "Reaper sweep failed");
                    }
                }
                event = events.recv() => match event {
                    Ok(QueueEvent::Stalled { id }) => {
                        info!(queue = %self.queue.name(), job_id = %id, "Stall reported; scanning after grace period");
                        tokio::select! {
                            () = sleep(self.config.stall_grace) => {}
                            _ = shutdown.changed() => break,
                        }
                        // One scan covers every notification that arrived during the grace period.
                        while events.try_recv().is_ok() {}
                        if let Err(e) = self.reclaim_ghosts().await {
                            error!(queue = %self.queue.name(), error = %e, "Ghost reclaim failed");
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(queue = %self.queue.name(), skipped, "Reaper lagged behind queue events");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }

        info!(queue = %self.queue.name(), "Reaper stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use eventmail_common::QueueMetrics;
    use serde_json::{Value, json};

    use super::*;
    use crate::job::JobOptions;
    use crate::queue::QueueName;
    use crate::rate_limit::RateLimiter;
    use crate::store::MemoryJobStore;
    use crate::workers::{JobError, JobHandler, Worker};

    fn backdate(job: &mut Job, ms: i64) {
        let then = Utc::now() - chrono::Duration::milliseconds(ms);
        job.processed_on = Some(then);
        job.progress_at = Some(then);
    }

    async fn ghost(store: &MemoryJobStore, queue: &Queue, options: &JobOptions) -> String {
        let id = queue.enqueue_raw(json!({}), options).await.unwrap();
        queue.fetch_next().await.unwrap().unwrap();
        store
            .update_job(queue.name().as_str(), &id, |job| backdate(job, 130_000))
            .await;
        id
    }

    /// Sends one email per job after the shared limiter lets it through.
    struct PacedSender {
        limiter: RateLimiter,
        sends: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for PacedSender {
        async fn handle(&self, job: &Job) -> Result<Value, JobError> {
            self.limiter
                .rate_limit(job.attempts_made.saturating_sub(1))
                .await;
            self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"sent": true}))
        }
    }

    fn setup() -> (Arc<MemoryJobStore>, Queue) {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Queue::new(QueueName::Email, store.clone());
        (store, queue)
    }

    #[tokio::test]
    async fn test_ghost_with_attempts_left_returns_to_waiting() {
        let (store, queue) = setup();
        let id = ghost(&store, &queue, &JobOptions::standard_email()).await;
        let reaper = Reaper::new(queue.clone(), ReaperConfig::default());

        let report = reaper.sweep().await.unwrap();
        assert_eq!(report.reclaimed, vec![id.clone()]);
        assert_eq!(report.before.active, 1);
        assert_eq!(report.after.active, 0);

        let job = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
    }

    #[tokio::test]
    async fn test_ghost_out_of_attempts_fails() {
        let (store, queue) = setup();
        let id = ghost(&store, &queue, &JobOptions::default().with_attempts(1)).await;
        let reaper = Reaper::new(queue.clone(), ReaperConfig::default());

        reaper.reclaim_ghosts().await.unwrap();

        let job = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.failed_reason.unwrap().starts_with("GhostJobError"));
    }

    #[tokio::test]
    async fn test_fresh_active_job_is_left_alone() {
        let (_store, queue) = setup();
        let id = queue.enqueue_raw(json!({}), &JobOptions::default()).await.unwrap();
        queue.fetch_next().await.unwrap().unwrap();
        let reaper = Reaper::new(queue.clone(), ReaperConfig::default());

        let report = reaper.sweep().await.unwrap();
        assert!(report.reclaimed.is_empty());
        assert!(report.removed.is_empty());
        assert_eq!(queue.get_job(&id).await.unwrap().unwrap().state, JobState::Active);
    }

    #[tokio::test]
    async fn test_old_job_with_fresh_heartbeat_is_left_alone() {
        let (store, queue) = setup();
        let id = queue.enqueue_raw(json!({}), &JobOptions::batch_email()).await.unwrap();
        let job = queue.fetch_next().await.unwrap().unwrap();
        store
            .update_job("email", &id, |job| backdate(job, 200_000))
            .await;
        queue.heartbeat(&job).await.unwrap();
        let reaper = Reaper::new(queue.clone(), ReaperConfig::default());

        let report = reaper.sweep().await.unwrap();
        assert!(report.reclaimed.is_empty());
        assert!(report.removed.is_empty());
        assert_eq!(queue.get_job(&id).await.unwrap().unwrap().state, JobState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_in_long_send_backoff_is_not_reclaimed() {
        let (store, queue) = setup();
        let id = queue.enqueue_raw(json!({}), &JobOptions::batch_email()).await.unwrap();
        let mut job = queue.fetch_next().await.unwrap().unwrap();
        job.attempts_made = 7;
        store
            .update_job("email", &id, |stored| {
                stored.attempts_made = 7;
                backdate(stored, 150_000);
            })
            .await;

        let sender = Arc::new(PacedSender {
            limiter: RateLimiter::default(),
            sends: AtomicU32::new(0),
        });
        let metrics = Arc::new(QueueMetrics::new());
        let worker = Arc::new(Worker::new(queue.clone(), sender.clone(), metrics.clone()));
        let running = tokio::spawn({
            let worker = Arc::clone(&worker);
            async move { worker.process(job).await }
        });

        // Well into the 192 s backoff of the seventh attempt.
        tokio::time::sleep(Duration::from_secs(30)).await;
        let reaper = Reaper::new(queue.clone(), ReaperConfig::default());
        let report = reaper.sweep().await.unwrap();
        assert!(report.reclaimed.is_empty());
        assert!(report.removed.is_empty());
        assert_eq!(queue.get_job(&id).await.unwrap().unwrap().state, JobState::Active);
        assert!(queue.fetch_next().await.unwrap().is_none());

        running.await.unwrap();
        assert_eq!(sender.sends.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.snapshot().completed_count, 1);
        assert_eq!(queue.get_counts().await.unwrap().total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_notification_triggers_reclaim() {
        let (store, queue) = setup();
        let id = ghost(&store, &queue, &JobOptions::standard_email()).await;
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Reaper::new(queue.clone(), ReaperConfig::default()).run(rx));

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.report_stalled(&id);
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(queue.get_job(&id).await.unwrap().unwrap().state, JobState::Waiting);
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
