//! Reminder scheduling worker.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use super::{JobError, JobHandler};
use crate::collaborators::ReminderScheduler;
use crate::job::Job;
use crate::jobs::JobPayload;

pub struct ReminderHandler {
    scheduler: Arc<dyn ReminderScheduler>,
}

impl ReminderHandler {
    #[must_use]
    pub fn new(scheduler: Arc<dyn ReminderScheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl JobHandler for ReminderHandler {
    async fn handle(&self, job: &Job) -> Result<Value, JobError> {
        let JobPayload::ReminderScheduling(request) = job.payload()? else {
            return Err(JobError::Validation(
                "reminder queue only accepts reminder scheduling requests".to_string(),
            ));
        };

        self.scheduler.schedule(&request).await?;
        debug!(
            job_id = %job.id,
            event_id = %request.event_id,
            recipient_id = %request.recipient_id,
            "Reminders scheduled"
        );
        Ok(json!({ "scheduled": true }))
    }
}
