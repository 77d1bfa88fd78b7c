//! Email worker.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{info, warn};
use validator::Validate;

use super::{JobError, JobHandler};
use crate::composer::EmailComposer;
use crate::job::Job;
use crate::jobs::{JobPayload, SendRequest, StandardSendRequest};
use crate::provider::{EmailProvider, ProviderError, SendReceipt};
use crate::rate_limit::RateLimiter;

/// Composer, rate limiter and provider behind every email that leaves the process.
#[derive(Clone)]
pub struct Mailer {
    composer: EmailComposer,
    limiter: Arc<RateLimiter>,
    provider: Arc<dyn EmailProvider>,
}

impl Mailer {
    #[must_use]
    pub fn new(
        composer: EmailComposer,
        limiter: Arc<RateLimiter>,
        provider: Arc<dyn EmailProvider>,
    ) -> Self {
        Self {
            composer,
            limiter,
            provider,
        }
    }

    #[must_use]
    pub const fn composer(&self) -> &EmailComposer {
        &self.composer
    }

    /// Wait for the rate limiter, then send. `attempt` is zero for a first send.
    pub async fn deliver(
        &self,
        request: &SendRequest,
        attempt: u32,
    ) -> Result<SendReceipt, ProviderError> {
        self.limiter.rate_limit(attempt).await;
        self.provider.send(request).await
    }

    /// Compose and deliver a standard send.
    pub async fn send_standard(
        &self,
        request: &StandardSendRequest,
        attempt: u32,
    ) -> Result<SendReceipt, JobError> {
        let send = self.composer.compose(request).await?;
        Ok(self.deliver(&send, attempt).await?)
    }
}

/// Handles standard and prebuilt sends on the email queue.
pub struct EmailHandler {
    mailer: Arc<Mailer>,
}

impl EmailHandler {
    #[must_use]
    pub const fn new(mailer: Arc<Mailer>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl JobHandler for EmailHandler {
    async fn handle(&self, job: &Job) -> Result<Value, JobError> {
        let request = match job.payload()? {
            JobPayload::PrebuiltSend(prebuilt) => {
                prebuilt.options.validate()?;
                prebuilt.options
            }
            JobPayload::StandardSend(standard) => self.mailer.composer().compose(&standard).await?,
            other @ (JobPayload::ReminderScheduling(_)
            | JobPayload::Notification(_)
            | JobPayload::PriorityBatch(_)) => {
                return Err(JobError::Validation(format!(
                    "{} payloads cannot be sent from the email queue",
                    other.kind()
                )));
            }
        };

        let attempt = job.attempts_made.saturating_sub(1);
        match self.mailer.deliver(&request, attempt).await {
            Ok(receipt) => {
                info!(job_id = %job.id, message_id = %receipt.id, to = ?request.to, "Email sent");
                Ok(json!({ "id": receipt.id }))
            }
            Err(e) => {
                if e.is_rate_limit() {
                    let next_delay = job.options.backoff.delay_for_attempt(job.attempts_made);
                    warn!(
                        job_id = %job.id,
                        attempt = job.attempts_made,
                        next_delay_ms = next_delay.as_millis() as u64,
                        error = %e,
                        "Provider rate limit hit; leaving retry to queue backoff"
                    );
                } else {
                    warn!(job_id = %job.id, attempt = job.attempts_made, error = %e, "Email send failed");
                }
                Err(e.into())
            }
        }
    }
}
