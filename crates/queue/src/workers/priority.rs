//! Priority email worker.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{JobError, JobHandler};
use crate::dispatcher::PriorityDispatcher;
use crate::job::Job;
use crate::jobs::JobPayload;

/// Runs priority batches through the [`PriorityDispatcher`].
pub struct PriorityHandler {
    dispatcher: Arc<PriorityDispatcher>,
}

impl PriorityHandler {
    #[must_use]
    pub const fn new(dispatcher: Arc<PriorityDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl JobHandler for PriorityHandler {
    async fn handle(&self, job: &Job) -> Result<Value, JobError> {
        let JobPayload::PriorityBatch(request) = job.payload()? else {
            return Err(JobError::Validation(
                "priority queue only accepts priority batches".to_string(),
            ));
        };

        let report = self.dispatcher.dispatch(&request).await?;
        Ok(json!({
            "sent": report.sent,
            "queued": report.queued.len(),
            "fellBack": report.fell_back,
        }))
    }
}
