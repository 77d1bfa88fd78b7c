//! Liveness heartbeat for a running job.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, warn};

use crate::job::Job;
use crate::queue::Queue;

/// Touches a job on a fixed interval while it runs.
///
/// The task is aborted when the guard is dropped, so it stops on success, failure
/// and unwinding alike.
#[derive(Debug)]
pub struct Heartbeat {
    handle: JoinHandle<()>,
}

impl Heartbeat {
    #[must_use]
    pub fn start(queue: Queue, job: Job, period: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match queue.heartbeat(&job).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(queue = %queue.name(), job_id = %job.id, "Job no longer owned; heartbeat stopped");
                        break;
                    }
                    Err(e) => {
                        warn!(queue = %queue.name(), job_id = %job.id, error = %e, "Heartbeat failed");
                    }
                }
            }
        });

        Self { handle }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
