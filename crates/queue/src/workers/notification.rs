//! Chat notification worker.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use super::{JobError, JobHandler};
use crate::collaborators::ChatNotifier;
use crate::job::Job;
use crate::jobs::JobPayload;

pub struct NotificationHandler {
    notifier: Arc<dyn ChatNotifier>,
}

impl NotificationHandler {
    #[must_use]
    pub fn new(notifier: Arc<dyn ChatNotifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl JobHandler for NotificationHandler {
    async fn handle(&self, job: &Job) -> Result<Value, JobError> {
        let JobPayload::Notification(request) = job.payload()? else {
            return Err(JobError::Validation(
                "notification queue only accepts notification requests".to_string(),
            ));
        };

        self.notifier.notify(&request).await?;
        debug!(job_id = %job.id, channel_id = %request.channel_id, "Notification posted");
        Ok(json!({ "posted": true }))
    }
}
