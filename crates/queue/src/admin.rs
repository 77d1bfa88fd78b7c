//! Operator repair commands.
//!
//! Every command here is safe to run twice: a second run finds nothing left to do.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use eventmail_common::{AppError, AppResult};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};
use validator::Validate;

use crate::job::{Job, JobCounts, JobOptions, JobState};
use crate::jobs::JobPayload;
use crate::provider::EmailProvider;
use crate::queue::Queue;

/// Active age after which `reset_active_jobs` touches a job.
pub const DEFAULT_RESET_THRESHOLD: Duration = Duration::from_secs(30);

/// Active age cleaned before a bulk fix.
pub const FIX_CLEAN_THRESHOLD: Duration = Duration::from_millis(10_000);

/// Completed jobs included in the `all` view.
pub const RECENT_COMPLETED_LIMIT: usize = 10;

/// Which jobs `show_jobs` lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobView {
    State(JobState),
    /// Waiting, active, delayed and failed jobs plus the most recent completions.
    All,
}

impl FromStr for JobView {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "all" {
            Ok(Self::All)
        } else {
            s.parse().map(Self::State)
        }
    }
}

/// Disposition applied by `fix_stuck_jobs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixMode {
    /// Re-enqueue as a fresh waiting job with the original options.
    Reset,
    /// Mark completed with a synthetic result.
    Complete,
    /// Delete.
    Remove,
}

impl FixMode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Reset => "reset",
            Self::Complete => "complete",
            Self::Remove => "remove",
        }
    }
}

impl fmt::Display for FixMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FixMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reset" => Ok(Self::Reset),
            "complete" => Ok(Self::Complete),
            "remove" => Ok(Self::Remove),
            other => Err(AppError::Validation(format!(
                "unknown fix mode: {other} (expected reset, complete or remove)"
            ))),
        }
    }
}

/// Display row for one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub id: String,
    pub state: JobState,
    pub kind: Option<&'static str>,
    pub recipient: Option<String>,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub processed_on: Option<DateTime<Utc>>,
    pub delay_until: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        let payload = job.payload().ok();
        Self {
            id: job.id.clone(),
            state: job.state,
            kind: payload.as_ref().map(JobPayload::kind),
            recipient: payload.as_ref().and_then(JobPayload::recipient),
            attempts_made: job.attempts_made,
            max_attempts: job.max_attempts(),
            created_at: job.created_at,
            processed_on: job.processed_on,
            delay_until: job.delay_until,
            failed_reason: job.failed_reason.clone(),
        }
    }
}

/// Outcome of `reset_active_jobs`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetReport {
    /// Moved straight back to `waiting`.
    pub moved: Vec<String>,
    /// Force-failed after the direct move was refused.
    pub force_failed: Vec<String>,
    /// Active jobs younger than the threshold.
    pub skipped: usize,
}

/// Outcome of `fix_stuck_jobs`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixReport {
    /// Removed by the initial clean pass.
    pub cleaned: Vec<String>,
    /// Jobs the mode was applied to.
    pub fixed: Vec<String>,
    /// Ids of the waiting jobs created in `reset` mode.
    pub requeued: Vec<String>,
    /// Jobs the mode could not be applied to.
    pub errors: Vec<String>,
}

/// Outcome of `process_job`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum ProcessOutcome {
    /// The prebuilt request was sent and the job completed.
    Sent { message_id: String },
    /// Completed without sending; the payload needs the full worker.
    MarkedComplete,
    /// The job is not `waiting` or `failed`.
    Skipped { state: JobState },
    NotFound,
}

/// Outcome of `retry_job`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum RetryOutcome {
    Retried,
    /// Only failed jobs are retried; nothing changed.
    NotFailed { state: JobState },
    NotFound,
}

/// Outcome of `reset_queue`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueResetReport {
    pub before: JobCounts,
    pub removed: usize,
    pub stats_cleared: u64,
    pub after: JobCounts,
}

/// Repair commands against one queue.
pub struct QueueAdmin {
    queue: Queue,
}

impl QueueAdmin {
    #[must_use]
    pub const fn new(queue: Queue) -> Self {
        Self { queue }
    }

    #[must_use]
    pub const fn queue(&self) -> &Queue {
        &self.queue
    }

    /// List jobs. `All` is sorted newest first by creation time.
    pub async fn show_jobs(&self, view: JobView, limit: usize) -> AppResult<Vec<JobSummary>> {
        let jobs = match view {
            JobView::State(state) => self.queue.get_jobs_by_state(&[state], 0, limit).await?,
            JobView::All => {
                let mut jobs = self
                    .queue
                    .get_jobs_by_state(
                        &[
                            JobState::Waiting,
                            JobState::Active,
                            JobState::Delayed,
                            JobState::Failed,
                        ],
                        0,
                        usize::MAX,
                    )
                    .await?;
                jobs.extend(
                    self.queue
                        .get_jobs_by_state(&[JobState::Completed], 0, RECENT_COMPLETED_LIMIT)
                        .await?,
                );
                jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                jobs.truncate(limit);
                jobs
            }
        };

        Ok(jobs.iter().map(JobSummary::from).collect())
    }

    /// Send active jobs older than `threshold` back to `waiting`.
    ///
    /// The direct move is tried first; when the store refuses it the job is
    /// force-failed so the normal retry path picks it up.
    pub async fn reset_active_jobs(&self, threshold: Duration) -> AppResult<ResetReport> {
        let now = Utc::now();
        let active = self
            .queue
            .get_jobs_by_state(&[JobState::Active], 0, usize::MAX)
            .await?;

        let mut report = ResetReport::default();
        for job in active {
            let age = job.active_for(now).unwrap_or_default();
            if age < threshold {
                report.skipped += 1;
                continue;
            }

            match self.queue.move_to_waiting(&job.id).await {
                Ok(true) => {
                    info!(queue = %self.queue.name(), job_id = %job.id, age_ms = age.as_millis() as u64, "Moved active job back to waiting");
                    report.moved.push(job.id);
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(queue = %self.queue.name(), job_id = %job.id, error = %e, "Direct move failed; force-failing");
                }
            }

            let reason = format!("Reset by operator after {}ms active", age.as_millis());
            if self.queue.force_fail(&job, &reason).await?.is_some() {
                report.force_failed.push(job.id);
            }
        }

        info!(
            queue = %self.queue.name(),
            moved = report.moved.len(),
            force_failed = report.force_failed.len(),
            skipped = report.skipped,
            "Active jobs reset"
        );
        Ok(report)
    }

    /// Clean long-stale active jobs, then apply `mode` to every remaining active job.
    pub async fn fix_stuck_jobs(&self, mode: FixMode) -> AppResult<FixReport> {
        let cleaned = self
            .queue
            .clean(FIX_CLEAN_THRESHOLD, JobState::Active)
            .await?;
        let active = self
            .queue
            .get_jobs_by_state(&[JobState::Active], 0, usize::MAX)
            .await?;

        let mut report = FixReport {
            cleaned,
            ..FixReport::default()
        };
        for job in active {
            match self.apply_fix(&job, mode).await {
                Ok(Some(new_id)) => {
                    report.requeued.push(new_id);
                    report.fixed.push(job.id);
                }
                Ok(None) => report.fixed.push(job.id),
                Err(e) => {
                    error!(queue = %self.queue.name(), job_id = %job.id, %mode, error = %e, "Failed to fix job");
                    report.errors.push(job.id);
                }
            }
        }

        info!(
            queue = %self.queue.name(),
            %mode,
            cleaned = report.cleaned.len(),
            fixed = report.fixed.len(),
            errors = report.errors.len(),
            "Stuck jobs fixed"
        );
        Ok(report)
    }

    async fn apply_fix(&self, job: &Job, mode: FixMode) -> AppResult<Option<String>> {
        match mode {
            FixMode::Reset => {
                // The initial delay was already served; the copy must be runnable now.
                let options = JobOptions {
                    delay: 0,
                    ..job.options.clone()
                };
                let new_id = self.queue.enqueue_raw(job.data.clone(), &options).await?;
                self.queue.remove_job(&job.id).await?;
                Ok(Some(new_id))
            }
            FixMode::Complete => {
                self.queue
                    .force_complete(&job.id, json!({ "forcedCompletion": true }))
                    .await?;
                Ok(None)
            }
            FixMode::Remove => {
                self.queue.remove_job(&job.id).await?;
                Ok(None)
            }
        }
    }

    /// Run one `waiting` or `failed` job by hand.
    ///
    /// Prebuilt sends go straight to `provider`. Anything else is marked complete
    /// with a note, since it needs the full worker to compose.
    pub async fn process_job(
        &self,
        id: &str,
        provider: &dyn EmailProvider,
    ) -> AppResult<ProcessOutcome> {
        let Some(job) = self.queue.get_job(id).await? else {
            return Ok(ProcessOutcome::NotFound);
        };
        if !matches!(job.state, JobState::Waiting | JobState::Failed) {
            info!(queue = %self.queue.name(), job_id = %id, state = %job.state, "Job not processable");
            return Ok(ProcessOutcome::Skipped { state: job.state });
        }

        if let JobPayload::PrebuiltSend(prebuilt) = job.payload()? {
            prebuilt.options.validate()?;
            let receipt = provider
                .send(&prebuilt.options)
                .await
                .map_err(|e| AppError::ExternalService(e.to_string()))?;
            self.queue
                .force_complete(id, json!({ "id": receipt.id, "manual": true }))
                .await?;
            info!(queue = %self.queue.name(), job_id = %id, message_id = %receipt.id, "Job sent manually");
            return Ok(ProcessOutcome::Sent {
                message_id: receipt.id,
            });
        }

        self.queue
            .force_complete(
                id,
                json!({ "manual": true, "note": "requires full template processing" }),
            )
            .await?;
        warn!(queue = %self.queue.name(), job_id = %id, "Job marked complete without sending; requires full template processing");
        Ok(ProcessOutcome::MarkedComplete)
    }

    /// Move a `failed` job back to `waiting`. Any other state is left as is.
    pub async fn retry_job(&self, id: &str) -> AppResult<RetryOutcome> {
        let Some(job) = self.queue.get_job(id).await? else {
            return Ok(RetryOutcome::NotFound);
        };
        if job.state != JobState::Failed {
            info!(queue = %self.queue.name(), job_id = %id, state = %job.state, "Job is not failed; nothing to retry");
            return Ok(RetryOutcome::NotFailed { state: job.state });
        }

        if self.queue.retry_job(id).await? {
            info!(queue = %self.queue.name(), job_id = %id, "Job retried");
            Ok(RetryOutcome::Retried)
        } else {
            let state = self
                .queue
                .get_job(id)
                .await?
                .map_or(JobState::Failed, |job| job.state);
            Ok(RetryOutcome::NotFailed { state })
        }
    }

    /// Remove every job, clear the stats keys, then pause and resume the queue.
    pub async fn reset_queue(&self) -> AppResult<QueueResetReport> {
        let before = self.queue.get_counts().await?;
        info!(queue = %self.queue.name(), counts = %before, "Resetting queue");

        let mut removed = 0;
        for state in JobState::ALL {
            removed += self.queue.clean(Duration::ZERO, state).await?.len();
        }
        let stats_cleared = self.queue.clear_stats().await?;
        self.queue.pause().await?;
        self.queue.resume().await?;

        let after = self.queue.get_counts().await?;
        info!(queue = %self.queue.name(), removed, after = %after, "Queue reset");
        Ok(QueueResetReport {
            before,
            removed,
            stats_cleared,
            after,
        })
    }
}
