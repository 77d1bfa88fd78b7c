//! In-process job store for tests and single-process runs.

use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use eventmail_common::AppResult;
use serde_json::Value;
use tokio::sync::Mutex;
use validator::Validate;

use super::{FailDisposition, JobStore, waiting_score};
use crate::job::{Job, JobCounts, JobOptions, JobState};

#[derive(Debug, Default)]
struct QueueData {
    next_id: u64,
    jobs: HashMap<String, Job>,
    paused: bool,
    stats: HashMap<&'static str, u64>,
}

impl QueueData {
    fn promote_due(&mut self, now: DateTime<Utc>) {
        for job in self.jobs.values_mut() {
            if job.state == JobState::Delayed && job.delay_until.is_none_or(|at| at <= now) {
                job.state = JobState::Waiting;
                job.delay_until = None;
            }
        }
    }

    fn bump_stat(&mut self, name: &'static str) {
        *self.stats.entry(name).or_default() += 1;
    }
}

fn sequence(job: &Job) -> u64 {
    job.id.parse().unwrap_or(u64::MAX)
}

fn score(job: &Job) -> f64 {
    waiting_score(job.options.priority, sequence(job))
}

/// When the job entered its current state.
fn state_timestamp(job: &Job) -> DateTime<Utc> {
    match job.state {
        JobState::Active => job.processed_on.unwrap_or(job.created_at),
        JobState::Completed | JobState::Failed => job.finished_on.unwrap_or(job.created_at),
        JobState::Waiting | JobState::Delayed => job.created_at,
    }
}

fn compare_in_state(state: JobState, a: &Job, b: &Job) -> Ordering {
    match state {
        JobState::Waiting => score(a).total_cmp(&score(b)),
        JobState::Active => a.processed_on.cmp(&b.processed_on),
        JobState::Delayed => a
            .delay_until
            .cmp(&b.delay_until)
            .then_with(|| sequence(a).cmp(&sequence(b))),
        JobState::Completed | JobState::Failed => b
            .finished_on
            .cmp(&a.finished_on)
            .then_with(|| sequence(b).cmp(&sequence(a))),
    }
}

/// Job store backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    queues: Mutex<HashMap<String, QueueData>>,
}

impl MemoryJobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Edit a stored job in place. Returns `false` when the job does not exist.
    ///
    /// Intended for seeding fixtures, such as backdating `processed_on`.
    pub async fn update_job<F>(&self, queue: &str, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut Job),
    {
        let mut queues = self.queues.lock().await;
        match queues.get_mut(queue).and_then(|q| q.jobs.get_mut(id)) {
            Some(job) => {
                f(job);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn add(&self, queue: &str, data: Value, options: &JobOptions) -> AppResult<String> {
        options.validate()?;

        let mut queues = self.queues.lock().await;
        let q = queues.entry(queue.to_string()).or_default();
        q.next_id += 1;
        let id = q.next_id.to_string();
        let now = Utc::now();

        let delay_until =
            (options.delay > 0).then(|| now + Duration::milliseconds(options.delay as i64));
        let job = Job {
            id: id.clone(),
            queue: queue.to_string(),
            data,
            options: options.clone(),
            state: if delay_until.is_some() {
                JobState::Delayed
            } else {
                JobState::Waiting
            },
            attempts_made: 0,
            created_at: now,
            processed_on: None,
            finished_on: None,
            progress_at: None,
            delay_until,
            failed_reason: None,
            return_value: None,
            token: None,
        };
        q.jobs.insert(id.clone(), job);

        Ok(id)
    }

    async fn fetch_next(&self, queue: &str, token: &str) -> AppResult<Option<Job>> {
        let mut queues = self.queues.lock().await;
        let Some(q) = queues.get_mut(queue) else {
            return Ok(None);
        };
        if q.paused {
            return Ok(None);
        }

        let now = Utc::now();
        q.promote_due(now);

        let next = q
            .jobs
            .values()
            .filter(|job| job.state == JobState::Waiting)
            .min_by(|a, b| score(a).total_cmp(&score(b)))
            .map(|job| job.id.clone());

        Ok(next.and_then(|id| {
            let job = q.jobs.get_mut(&id)?;
            job.state = JobState::Active;
            job.processed_on = Some(now);
            job.progress_at = Some(now);
            job.attempts_made += 1;
            job.token = Some(token.to_string());
            Some(job.clone())
        }))
    }

    async fn heartbeat(&self, queue: &str, id: &str, token: &str) -> AppResult<bool> {
        let mut queues = self.queues.lock().await;
        let Some(job) = queues.get_mut(queue).and_then(|q| q.jobs.get_mut(id)) else {
            return Ok(false);
        };
        if job.state != JobState::Active || job.token.as_deref() != Some(token) {
            return Ok(false);
        }
        job.progress_at = Some(Utc::now());
        Ok(true)
    }

    async fn complete(
        &self,
        queue: &str,
        id: &str,
        token: Option<&str>,
        return_value: Value,
        remove: bool,
    ) -> AppResult<bool> {
        let mut queues = self.queues.lock().await;
        let Some(q) = queues.get_mut(queue) else {
            return Ok(false);
        };
        let Some(job) = q.jobs.get_mut(id) else {
            return Ok(false);
        };

        let allowed = match token {
            Some(token) => job.state == JobState::Active && job.token.as_deref() == Some(token),
            None => job.state != JobState::Completed,
        };
        if !allowed {
            return Ok(false);
        }

        if remove {
            q.jobs.remove(id);
        } else {
            job.state = JobState::Completed;
            job.finished_on = Some(Utc::now());
            job.return_value = Some(return_value);
            job.failed_reason = None;
            job.delay_until = None;
            job.token = None;
        }
        q.bump_stat("completed");

        Ok(true)
    }

    async fn fail(
        &self,
        queue: &str,
        id: &str,
        token: Option<&str>,
        reason: &str,
        disposition: FailDisposition,
    ) -> AppResult<Option<JobState>> {
        let mut queues = self.queues.lock().await;
        let Some(q) = queues.get_mut(queue) else {
            return Ok(None);
        };
        let Some(job) = q.jobs.get_mut(id) else {
            return Ok(None);
        };
        if job.state != JobState::Active {
            return Ok(None);
        }
        if let Some(token) = token {
            if job.token.as_deref() != Some(token) {
                return Ok(None);
            }
        }

        let now = Utc::now();
        job.token = None;
        let next = match disposition {
            FailDisposition::Retry { delay_ms: 0 } => {
                job.state = JobState::Waiting;
                JobState::Waiting
            }
            FailDisposition::Retry { delay_ms } => {
                job.state = JobState::Delayed;
                job.delay_until = Some(now + Duration::milliseconds(delay_ms as i64));
                JobState::Delayed
            }
            FailDisposition::Terminal => {
                job.state = JobState::Failed;
                job.failed_reason = Some(reason.to_string());
                job.finished_on = Some(now);
                if job.options.remove_on_fail {
                    q.jobs.remove(id);
                }
                JobState::Failed
            }
        };
        q.bump_stat("failed");

        Ok(Some(next))
    }

    async fn get(&self, queue: &str, id: &str) -> AppResult<Option<Job>> {
        let queues = self.queues.lock().await;
        Ok(queues.get(queue).and_then(|q| q.jobs.get(id)).cloned())
    }

    async fn list(
        &self,
        queue: &str,
        state: JobState,
        offset: usize,
        limit: usize,
    ) -> AppResult<Vec<Job>> {
        let mut queues = self.queues.lock().await;
        let Some(q) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };
        q.promote_due(Utc::now());

        let mut jobs: Vec<Job> = q
            .jobs
            .values()
            .filter(|job| job.state == state)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| compare_in_state(state, a, b));

        Ok(jobs.into_iter().skip(offset).take(limit).collect())
    }

    async fn counts(&self, queue: &str) -> AppResult<JobCounts> {
        let mut queues = self.queues.lock().await;
        let mut counts = JobCounts::default();
        let Some(q) = queues.get_mut(queue) else {
            return Ok(counts);
        };
        q.promote_due(Utc::now());

        for job in q.jobs.values() {
            match job.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
                JobState::Delayed => counts.delayed += 1,
            }
        }

        Ok(counts)
    }

    async fn clean(
        &self,
        queue: &str,
        state: JobState,
        older_than_ms: u64,
    ) -> AppResult<Vec<String>> {
        let mut queues = self.queues.lock().await;
        let Some(q) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let cutoff = Utc::now() - Duration::milliseconds(older_than_ms as i64);
        let mut removed: Vec<String> = q
            .jobs
            .values()
            .filter(|job| job.state == state && state_timestamp(job) <= cutoff)
            .map(|job| job.id.clone())
            .collect();
        removed.sort_by_key(|id| id.parse::<u64>().unwrap_or(u64::MAX));

        for id in &removed {
            q.jobs.remove(id);
        }

        Ok(removed)
    }

    async fn remove(&self, queue: &str, id: &str) -> AppResult<bool> {
        let mut queues = self.queues.lock().await;
        Ok(queues
            .get_mut(queue)
            .and_then(|q| q.jobs.remove(id))
            .is_some())
    }

    async fn retry(&self, queue: &str, id: &str) -> AppResult<bool> {
        let mut queues = self.queues.lock().await;
        let Some(job) = queues.get_mut(queue).and_then(|q| q.jobs.get_mut(id)) else {
            return Ok(false);
        };
        if job.state != JobState::Failed {
            return Ok(false);
        }

        job.state = JobState::Waiting;
        job.attempts_made = 0;
        job.failed_reason = None;
        job.finished_on = None;
        job.delay_until = None;
        Ok(true)
    }

    async fn move_active_to_waiting(&self, queue: &str, id: &str) -> AppResult<bool> {
        let mut queues = self.queues.lock().await;
        let Some(job) = queues.get_mut(queue).and_then(|q| q.jobs.get_mut(id)) else {
            return Ok(false);
        };
        if job.state != JobState::Active {
            return Ok(false);
        }

        job.state = JobState::Waiting;
        job.token = None;
        Ok(true)
    }

    async fn set_paused(&self, queue: &str, paused: bool) -> AppResult<()> {
        let mut queues = self.queues.lock().await;
        queues.entry(queue.to_string()).or_default().paused = paused;
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> AppResult<bool> {
        let queues = self.queues.lock().await;
        Ok(queues.get(queue).is_some_and(|q| q.paused))
    }

    async fn clear_stats(&self, queue: &str) -> AppResult<u64> {
        let mut queues = self.queues.lock().await;
        let Some(q) = queues.get_mut(queue) else {
            return Ok(0);
        };
        let removed = q.stats.len() as u64;
        q.stats.clear();
        Ok(removed)
    }

    async fn ping(&self) -> bool {
        true
    }
}
