//! Durable job storage.
//!
//! A [`JobStore`] owns the state machine of every job across all queues. Each
//! primitive is atomic with respect to other callers: no two workers can fetch the
//! same job, and token-guarded transitions only apply for the worker that owns the
//! job.

mod memory;
mod redis;

use async_trait::async_trait;
use eventmail_common::AppResult;
use serde_json::Value;

use crate::job::{Job, JobCounts, JobOptions, JobState};

pub use memory::MemoryJobStore;
pub use redis::RedisJobStore;

/// What happens to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    /// Back to `waiting`, or `delayed` when `delay_ms > 0`.
    Retry { delay_ms: u64 },
    /// Terminal `failed` (removed instead when the job asks for it).
    Terminal,
}

/// Storage backend for queues.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Store a new job and return its id.
    async fn add(&self, queue: &str, data: Value, options: &JobOptions) -> AppResult<String>;

    /// Claim the next eligible job under `token`.
    ///
    /// Promotes due delayed jobs first and returns `None` while the queue is paused.
    async fn fetch_next(&self, queue: &str, token: &str) -> AppResult<Option<Job>>;

    /// Refresh the heartbeat of an active job owned by `token`.
    async fn heartbeat(&self, queue: &str, id: &str, token: &str) -> AppResult<bool>;

    /// Mark a job completed, deleting it instead when `remove` is set.
    ///
    /// With a token, only applies while the job is active and owned by it. Without a
    /// token, applies to any job that is not already completed.
    async fn complete(
        &self,
        queue: &str,
        id: &str,
        token: Option<&str>,
        return_value: Value,
        remove: bool,
    ) -> AppResult<bool>;

    /// Record a failed attempt on an active job, owned by `token` when one is given.
    ///
    /// Returns the state the job moved to, or `None` when nothing changed.
    async fn fail(
        &self,
        queue: &str,
        id: &str,
        token: Option<&str>,
        reason: &str,
        disposition: FailDisposition,
    ) -> AppResult<Option<JobState>>;

    async fn get(&self, queue: &str, id: &str) -> AppResult<Option<Job>>;

    /// Jobs in one state.
    ///
    /// `waiting` is in processing order, `active` and `delayed` oldest first,
    /// `completed` and `failed` newest first.
    async fn list(
        &self,
        queue: &str,
        state: JobState,
        offset: usize,
        limit: usize,
    ) -> AppResult<Vec<Job>>;

    async fn counts(&self, queue: &str) -> AppResult<JobCounts>;

    /// Remove jobs that have been in `state` for at least `older_than_ms`.
    async fn clean(&self, queue: &str, state: JobState, older_than_ms: u64)
    -> AppResult<Vec<String>>;

    /// Delete a job from every state.
    async fn remove(&self, queue: &str, id: &str) -> AppResult<bool>;

    /// Move a `failed` job back to `waiting` with a fresh attempt budget.
    async fn retry(&self, queue: &str, id: &str) -> AppResult<bool>;

    /// Move an `active` job straight back to `waiting` without touching its attempts.
    async fn move_active_to_waiting(&self, queue: &str, id: &str) -> AppResult<bool>;

    async fn set_paused(&self, queue: &str, paused: bool) -> AppResult<()>;

    async fn is_paused(&self, queue: &str) -> AppResult<bool>;

    /// Drop per-queue statistics. Returns the number of keys removed.
    async fn clear_stats(&self, queue: &str) -> AppResult<u64>;

    /// Whether the backend is reachable.
    async fn ping(&self) -> bool;
}

/// Sort key of a waiting job: lower priority first, then insertion order.
#[must_use]
pub(crate) fn waiting_score(priority: u32, sequence: u64) -> f64 {
    f64::from(priority) * 4_294_967_296.0 + sequence as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_waiting_score_orders_priority_then_fifo() {
        assert!(waiting_score(0, 10) < waiting_score(0, 11));
        assert!(waiting_score(0, 4_000_000_000) < waiting_score(1, 1));
        assert!(waiting_score(2, 1) > waiting_score(1, 999));
    }
}
