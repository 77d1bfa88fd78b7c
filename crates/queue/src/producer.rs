//! Producer and monitoring API.
//!
//! This module is what event and RSVP handlers call. It owns one [`Queue`] per lane
//! and the process counters the workers report into.

use std::sync::Arc;

use eventmail_common::{AppError, AppResult, ProcessMetrics, QueueMetrics};
use serde::Serialize;
use tracing::debug;
use validator::Validate;

use crate::job::{JobCounts, JobOptions};
use crate::jobs::{JobPayload, NotificationRequest, PriorityBatchRequest, ReminderSchedulingRequest};
use crate::queue::{Queue, QueueName};
use crate::store::JobStore;

/// Durable counts plus this process's counters for one lane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    #[serde(flatten)]
    pub counts: JobCounts,
    pub process_metrics: ProcessMetrics,
}

struct Lane {
    queue: Queue,
    metrics: Arc<QueueMetrics>,
}

impl Lane {
    fn new(name: QueueName, store: &Arc<dyn JobStore>) -> Self {
        Self {
            queue: Queue::new(name, Arc::clone(store)),
            metrics: Arc::new(QueueMetrics::new()),
        }
    }
}

/// The four mail lanes behind one store.
pub struct MailQueues {
    email: Lane,
    priority_email: Lane,
    reminder: Lane,
    slack: Lane,
}

impl MailQueues {
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            email: Lane::new(QueueName::Email, &store),
            priority_email: Lane::new(QueueName::PriorityEmail, &store),
            reminder: Lane::new(QueueName::ReminderScheduling, &store),
            slack: Lane::new(QueueName::SlackNotification, &store),
        }
    }

    const fn lane(&self, name: QueueName) -> &Lane {
        match name {
            QueueName::Email => &self.email,
            QueueName::PriorityEmail => &self.priority_email,
            QueueName::ReminderScheduling => &self.reminder,
            QueueName::SlackNotification => &self.slack,
        }
    }

    #[must_use]
    pub const fn queue(&self, name: QueueName) -> &Queue {
        &self.lane(name).queue
    }

    #[must_use]
    pub fn metrics_for(&self, name: QueueName) -> Arc<QueueMetrics> {
        Arc::clone(&self.lane(name).metrics)
    }

    /// Queue one email. Only standard and prebuilt sends are accepted.
    pub async fn queue_email(&self, payload: impl Into<JobPayload>) -> AppResult<String> {
        let payload = email_payload(payload.into())?;
        let id = self
            .email
            .queue
            .enqueue(&payload, &JobOptions::single_email())
            .await?;
        debug!(job_id = %id, kind = payload.kind(), "Email queued");
        Ok(id)
    }

    /// Queue many emails. Each item succeeds or fails on its own.
    pub async fn queue_email_batch<P>(&self, payloads: Vec<P>) -> Vec<AppResult<String>>
    where
        P: Into<JobPayload>,
    {
        let mut results = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let result = match email_payload(payload.into()) {
                Ok(payload) => {
                    self.email
                        .queue
                        .enqueue(&payload, &JobOptions::batch_email())
                        .await
                }
                Err(e) => Err(e),
            };
            results.push(result);
        }
        results
    }

    pub async fn queue_priority_email(&self, request: PriorityBatchRequest) -> AppResult<String> {
        self.priority_email
            .queue
            .enqueue(&request.into(), &JobOptions::priority_email())
            .await
    }

    pub async fn queue_reminder_scheduling(
        &self,
        request: ReminderSchedulingRequest,
    ) -> AppResult<String> {
        self.reminder
            .queue
            .enqueue(&request.into(), &JobOptions::reminder())
            .await
    }

    /// Queue many reminder requests. Each item succeeds or fails on its own.
    pub async fn queue_reminder_batch(
        &self,
        requests: Vec<ReminderSchedulingRequest>,
    ) -> Vec<AppResult<String>> {
        let payloads: Vec<JobPayload> = requests.into_iter().map(JobPayload::from).collect();
        self.reminder
            .queue
            .enqueue_batch(&payloads, &JobOptions::reminder())
            .await
    }

    pub async fn queue_slack_notification(&self, request: NotificationRequest) -> AppResult<String> {
        self.slack
            .queue
            .enqueue(&request.into(), &JobOptions::notification())
            .await
    }

    /// Stats for any lane.
    pub async fn stats(&self, name: QueueName) -> AppResult<QueueStats> {
        let lane = self.lane(name);
        Ok(QueueStats {
            counts: lane.queue.get_counts().await?,
            process_metrics: lane.metrics.snapshot(),
        })
    }

    pub async fn get_queue_stats(&self) -> AppResult<QueueStats> {
        self.stats(QueueName::Email).await
    }

    pub async fn get_priority_email_queue_stats(&self) -> AppResult<QueueStats> {
        self.stats(QueueName::PriorityEmail).await
    }

    pub async fn get_reminder_queue_stats(&self) -> AppResult<QueueStats> {
        self.stats(QueueName::ReminderScheduling).await
    }

    pub async fn get_slack_queue_stats(&self) -> AppResult<QueueStats> {
        self.stats(QueueName::SlackNotification).await
    }

    /// Process counters of every lane in Prometheus text format.
    #[must_use]
    pub fn prometheus(&self) -> String {
        QueueName::ALL
            .iter()
            .map(|name| self.lane(*name).metrics.to_prometheus(name.as_str()))
            .collect()
    }
}

fn email_payload(payload: JobPayload) -> AppResult<JobPayload> {
    match payload {
        JobPayload::StandardSend(ref request) => {
            request.validate()?;
            Ok(payload)
        }
        JobPayload::PrebuiltSend(ref request) => {
            request.options.validate()?;
            Ok(payload)
        }
        other => Err(AppError::Validation(format!(
            "{} payloads cannot be queued as email",
            other.kind()
        ))),
    }
}
