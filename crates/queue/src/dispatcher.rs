//! Priority dispatch.
//!
//! Proposers, and the first few attendees, of a batch are mailed synchronously and in
//! order, ahead of whatever sits in the email queue. Everyone else is handed to the
//! email queue. If a direct send fails the whole batch is queued instead.

use std::sync::Arc;

use eventmail_common::{AppError, AppResult};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::dates::normalize_event_dates;
use crate::job::JobOptions;
use crate::jobs::{JobPayload, PriorityBatchRequest, StandardSendRequest};
use crate::queue::Queue;
use crate::workers::{JobError, Mailer};

/// Default number of attendees mailed directly.
pub const DEFAULT_DIRECT_ATTENDEE_CAP: usize = 10;

/// Outcome of one dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    /// Emails sent directly.
    pub sent: usize,
    /// Ids of email jobs created for the remainder.
    pub queued: Vec<String>,
    /// Whether the direct path failed and the full batch was queued.
    pub fell_back: bool,
}

/// Sends a priority batch directly and queues the overflow.
#[derive(Clone)]
pub struct PriorityDispatcher {
    mailer: Arc<Mailer>,
    email_queue: Queue,
    direct_attendee_cap: usize,
}

impl PriorityDispatcher {
    #[must_use]
    pub const fn new(mailer: Arc<Mailer>, email_queue: Queue) -> Self {
        Self {
            mailer,
            email_queue,
            direct_attendee_cap: DEFAULT_DIRECT_ATTENDEE_CAP,
        }
    }

    #[must_use]
    pub const fn with_direct_attendee_cap(mut self, cap: usize) -> Self {
        self.direct_attendee_cap = cap;
        self
    }

    pub async fn dispatch(&self, request: &PriorityBatchRequest) -> AppResult<DispatchReport> {
        let (proposers, attendees) = prepare(request);
        let split = self.direct_attendee_cap.min(attendees.len());
        let (direct, overflow) = attendees.split_at(split);

        info!(
            proposers = proposers.len(),
            attendees = attendees.len(),
            direct_attendees = direct.len(),
            "Dispatching priority batch"
        );

        match self.send_direct(&proposers, direct).await {
            Ok(sent) => {
                let queued = self.enqueue_all(overflow).await?;
                info!(sent, queued = queued.len(), "Priority batch dispatched");
                Ok(DispatchReport {
                    sent,
                    queued,
                    fell_back: false,
                })
            }
            Err((sent, e)) => {
                error!(
                    sent,
                    error = %e,
                    proposers = proposers.len(),
                    attendees = attendees.len(),
                    "Direct send failed; queueing the full batch"
                );
                let mut queued = self.enqueue_all(&proposers).await?;
                queued.extend(self.enqueue_all(&attendees).await?);
                warn!(queued = queued.len(), "Priority batch queued after fallback");
                Ok(DispatchReport {
                    sent,
                    queued,
                    fell_back: true,
                })
            }
        }
    }

    /// Send proposers, then the capped attendees, in order. Stops at the first failure.
    async fn send_direct(
        &self,
        proposers: &[StandardSendRequest],
        attendees: &[StandardSendRequest],
    ) -> Result<usize, (usize, JobError)> {
        let mut sent = 0;
        for request in proposers.iter().chain(attendees) {
            match self.mailer.send_standard(request, 0).await {
                Ok(receipt) => {
                    info!(to = %request.receiver.email, message_id = %receipt.id, "Priority email sent");
                    sent += 1;
                }
                Err(e) => return Err((sent, e)),
            }
        }
        Ok(sent)
    }

    /// Queue every request as an email job. All items are attempted before the first
    /// failure is returned.
    async fn enqueue_all(&self, requests: &[StandardSendRequest]) -> AppResult<Vec<String>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let payloads: Vec<JobPayload> = requests.iter().cloned().map(JobPayload::from).collect();
        let results = self
            .email_queue
            .enqueue_batch(&payloads, &JobOptions::batch_email())
            .await;

        let mut ids = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(id) => ids.push(id),
                Err(e) => failures.push(e.to_string()),
            }
        }
        if failures.is_empty() {
            Ok(ids)
        } else {
            Err(AppError::Queue(format!(
                "failed to queue {} of {} priority emails: {}",
                failures.len(),
                requests.len(),
                failures.join("; ")
            )))
        }
    }
}

/// Normalise dates and drop attendee entries that repeat a creator already listed as
/// a proposer.
fn prepare(request: &PriorityBatchRequest) -> (Vec<StandardSendRequest>, Vec<StandardSendRequest>) {
    let mut event = request.event.clone();
    normalize_event_dates(&mut event);

    let with_event = |recipient: &StandardSendRequest| {
        let mut recipient = recipient.clone();
        if recipient.event.is_null() {
            recipient.event = event.clone();
        } else {
            normalize_event_dates(&mut recipient.event);
        }
        recipient
    };

    let proposers: Vec<_> = request.proposer_recipients.iter().map(with_event).collect();

    let creator_is_proposer = request.creator_id.as_deref().filter(|creator| {
        proposers
            .iter()
            .any(|p| p.receiver.id.as_deref() == Some(*creator))
    });
    let attendees = request
        .attendee_recipients
        .iter()
        .filter(|a| {
            creator_is_proposer.is_none() || a.receiver.id.as_deref() != creator_is_proposer
        })
        .map(with_event)
        .collect();

    (proposers, attendees)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::collaborators::PlainTemplateResolver;
    use crate::composer::EmailComposer;
    use crate::job::JobState;
    use crate::jobs::{EmailType, Receiver, SendRequest};
    use crate::provider::{EmailProvider, ProviderError, SendReceipt};
    use crate::queue::QueueName;
    use crate::rate_limit::{RateLimitPolicy, RateLimiter};
    use crate::store::MemoryJobStore;

    struct Provider {
        sent: Mutex<Vec<String>>,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl EmailProvider for Provider {
        async fn send(&self, request: &SendRequest) -> Result<SendReceipt, ProviderError> {
            let mut sent = self.sent.lock().unwrap();
            if self.fail_after.is_some_and(|limit| sent.len() >= limit) {
                return Err(ProviderError::Transport("connection refused".into()));
            }
            sent.push(request.to[0].clone());
            Ok(SendReceipt {
                id: format!("msg-{}", sent.len()),
            })
        }
    }

    fn setup(fail_after: Option<usize>, cap: usize) -> (PriorityDispatcher, Queue, Arc<Provider>) {
        let provider = Arc::new(Provider {
            sent: Mutex::default(),
            fail_after,
        });
        let policy = RateLimitPolicy {
            fixed_delay: Duration::from_millis(1),
            max_jitter: Duration::ZERO,
        };
        let mailer = Arc::new(Mailer::new(
            EmailComposer::new("events@example.com", Arc::new(PlainTemplateResolver)),
            Arc::new(RateLimiter::new(policy)),
            provider.clone(),
        ));
        let queue = Queue::new(QueueName::Email, Arc::new(MemoryJobStore::new()));
        let dispatcher =
            PriorityDispatcher::new(mailer, queue.clone()).with_direct_attendee_cap(cap);
        (dispatcher, queue, provider)
    }

    fn recipient(id: &str) -> StandardSendRequest {
        let mut receiver = Receiver::new(format!("{id}@example.com"));
        receiver.id = Some(id.to_string());
        StandardSendRequest::new(
            receiver,
            json!({"title": "Launch", "startTime": 1_700_000_000_000_i64}),
            EmailType::Invitation,
        )
    }

    fn batch(proposers: &[&str], attendees: &[&str]) -> PriorityBatchRequest {
        PriorityBatchRequest {
            event: json!({"title": "Launch"}),
            creator_id: None,
            proposer_recipients: proposers.iter().map(|id| recipient(id)).collect(),
            attendee_recipients: attendees.iter().map(|id| recipient(id)).collect(),
        }
    }

    #[tokio::test]
    async fn test_proposers_first_then_capped_attendees() {
        let (dispatcher, queue, provider) = setup(None, 2);
        let report = dispatcher
            .dispatch(&batch(&["p1", "p2"], &["a1", "a2", "a3", "a4"]))
            .await
            .unwrap();

        assert_eq!(report.sent, 4);
        assert!(!report.fell_back);
        assert_eq!(report.queued.len(), 2);
        assert_eq!(
            *provider.sent.lock().unwrap(),
            vec![
                "p1@example.com",
                "p2@example.com",
                "a1@example.com",
                "a2@example.com"
            ]
        );

        let waiting = queue
            .get_jobs_by_state(&[JobState::Waiting], 0, 10)
            .await
            .unwrap();
        let recipients: Vec<_> = waiting
            .iter()
            .map(|job| job.payload().unwrap().recipient().unwrap())
            .collect();
        assert_eq!(recipients, vec!["a3@example.com", "a4@example.com"]);
        assert_eq!(waiting[0].options, JobOptions::batch_email());
    }

    #[tokio::test]
    async fn test_fallback_queues_every_recipient() {
        let (dispatcher, queue, provider) = setup(Some(0), 10);
        let report = dispatcher
            .dispatch(&batch(&["p1", "p2"], &["a1", "a2", "a3", "a4", "a5"]))
            .await
            .unwrap();

        assert!(report.fell_back);
        assert_eq!(report.sent, 0);
        assert_eq!(report.queued.len(), 7);
        assert!(provider.sent.lock().unwrap().is_empty());

        let counts = queue.get_counts().await.unwrap();
        assert_eq!(counts.waiting, 7);
        let jobs = queue
            .get_jobs_by_state(&[JobState::Waiting], 0, 10)
            .await
            .unwrap();
        let mut recipients: Vec<_> = jobs
            .iter()
            .map(|job| job.payload().unwrap().recipient().unwrap())
            .collect();
        recipients.sort();
        recipients.dedup();
        assert_eq!(recipients.len(), 7);
    }

    #[tokio::test]
    async fn test_creator_listed_once() {
        let (dispatcher, _queue, provider) = setup(None, 10);
        let mut request = batch(&["creator"], &["creator", "a1"]);
        request.creator_id = Some("creator".into());

        let report = dispatcher.dispatch(&request).await.unwrap();
        assert_eq!(report.sent, 2);
        assert_eq!(
            *provider.sent.lock().unwrap(),
            vec!["creator@example.com", "a1@example.com"]
        );
    }

    #[test]
    fn test_prepare_normalises_recipient_events() {
        let mut request = batch(&["p1"], &[]);
        request.event = json!({"title": "Launch", "startTime": "2026-03-01T18:30:00Z"});
        request.proposer_recipients.push(StandardSendRequest::new(
            Receiver::new("p2@example.com"),
            serde_json::Value::Null,
            EmailType::ProposerConfirmation,
        ));

        let (proposers, _) = prepare(&request);
        assert_eq!(proposers[0].event["startTime"], "2023-11-14T22:13:20+00:00");
        assert_eq!(proposers[1].event["startTime"], "2026-03-01T18:30:00+00:00");
    }
}
