//! Job records, lifecycle states and enqueue options.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use eventmail_common::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use crate::jobs::JobPayload;
use crate::retry::Backoff;

/// Highest priority value a store can order (lower value runs first).
pub const MAX_PRIORITY: u32 = 2_097_151;

/// Default execution budget before a job is considered stalled.
pub const DEFAULT_TIMEOUT_MS: u64 = 120_000;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
}

impl JobState {
    /// Every state, in display order.
    pub const ALL: [Self; 5] = [
        Self::Waiting,
        Self::Active,
        Self::Delayed,
        Self::Failed,
        Self::Completed,
    ];

    /// Stable lowercase name, also used for broker keys.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Delayed => "delayed",
        }
    }

    /// Terminal unless retried by an operator.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" | "wait" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "delayed" => Ok(Self::Delayed),
            other => Err(AppError::Validation(format!("unknown job state: {other}"))),
        }
    }
}

/// Options applied when a job is enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    /// Attempt ceiling, including the first run.
    #[validate(range(min = 1, message = "attempts must be at least 1"))]
    pub attempts: u32,
    pub backoff: Backoff,
    /// Delete the job record as soon as it completes.
    pub remove_on_complete: bool,
    /// Delete the job record on terminal failure.
    pub remove_on_fail: bool,
    /// Lower runs first; ties are FIFO.
    #[serde(default)]
    #[validate(range(max = MAX_PRIORITY, message = "priority exceeds the maximum"))]
    pub priority: u32,
    /// Initial delay before the job becomes eligible.
    #[serde(default)]
    pub delay: u64,
    /// Execution budget before the broker may consider the job stalled.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

const fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl Default for JobOptions {
    fn default() -> Self {
        Self::standard_email()
    }
}

impl JobOptions {
    const fn preset(attempts: u32, backoff_ms: u64) -> Self {
        Self {
            attempts,
            backoff: Backoff::exponential(backoff_ms),
            remove_on_complete: true,
            remove_on_fail: false,
            priority: 0,
            delay: 0,
            timeout: DEFAULT_TIMEOUT_MS,
        }
    }

    /// Worker-level default for the email lane.
    #[must_use]
    pub const fn standard_email() -> Self {
        Self::preset(5, 3000)
    }

    /// A single ad-hoc email.
    #[must_use]
    pub const fn single_email() -> Self {
        Self::preset(10, 3000)
    }

    /// One item of a batched email enqueue.
    #[must_use]
    pub const fn batch_email() -> Self {
        Self::preset(20, 3000)
    }

    /// Priority dispatch batches.
    #[must_use]
    pub const fn priority_email() -> Self {
        Self::preset(3, 1000)
    }

    /// Chat notifications.
    #[must_use]
    pub const fn notification() -> Self {
        Self::preset(3, 2000)
    }

    /// Reminder scheduling.
    #[must_use]
    pub const fn reminder() -> Self {
        Self::preset(5, 5000)
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay.as_millis() as u64;
        self
    }

    #[must_use]
    pub const fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

/// A job as stored by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    /// Queue (lane) name.
    pub queue: String,
    /// Raw payload; decode with [`Job::payload`].
    pub data: Value,
    pub options: JobOptions,
    pub state: JobState,
    pub attempts_made: u32,
    pub created_at: DateTime<Utc>,
    /// When the job last became active.
    pub processed_on: Option<DateTime<Utc>>,
    pub finished_on: Option<DateTime<Utc>>,
    /// Last heartbeat while active.
    pub progress_at: Option<DateTime<Utc>>,
    /// When a delayed job becomes eligible.
    pub delay_until: Option<DateTime<Utc>>,
    /// Last error, kept only on terminal failure.
    pub failed_reason: Option<String>,
    pub return_value: Option<Value>,
    /// Lock token held by the owning worker while active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Job {
    /// Decode the payload into its tagged shape.
    ///
    /// Malformed or incomplete payloads surface as [`AppError::Validation`].
    pub fn payload(&self) -> AppResult<JobPayload> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| AppError::Validation(format!("malformed payload for job {}: {e}", self.id)))
    }

    /// Attempt ceiling for this job.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.options.attempts
    }

    /// Whether another attempt is allowed after the current one.
    #[must_use]
    pub const fn has_attempts_left(&self) -> bool {
        self.attempts_made < self.options.attempts
    }

    /// How long the job has been active at `now`.
    #[must_use]
    pub fn active_for(&self, now: DateTime<Utc>) -> Option<Duration> {
        let processed_on = self.processed_on?;
        (now - processed_on).to_std().ok()
    }

    /// Time since the last sign of life: the latest heartbeat, or activation.
    #[must_use]
    pub fn quiet_for(&self, now: DateTime<Utc>) -> Option<Duration> {
        let last_seen = self.progress_at.or(self.processed_on)?;
        Some((now - last_seen).to_std().unwrap_or_default())
    }
}

/// Number of jobs per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

impl JobCounts {
    /// Count for one state.
    #[must_use]
    pub const fn get(&self, state: JobState) -> u64 {
        match state {
            JobState::Waiting => self.waiting,
            JobState::Active => self.active,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Delayed => self.delayed,
        }
    }

    /// Jobs that still need work.
    #[must_use]
    pub const fn pending(&self) -> u64 {
        self.waiting + self.active + self.delayed
    }

    #[must_use]
    pub const fn total(&self) -> u64 {
        self.waiting + self.active + self.completed + self.failed + self.delayed
    }
}

impl fmt::Display for JobCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "waiting={} active={} delayed={} failed={} completed={}",
            self.waiting, self.active, self.delayed, self.failed, self.completed
        )
    }
}
