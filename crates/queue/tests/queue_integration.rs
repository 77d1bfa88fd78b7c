//! Queue integration tests.
//!
//! These tests drive the public API against the in-memory store, end to end from
//! producer to worker, reaper and admin commands.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use eventmail_common::QueueMetrics;
use eventmail_queue::collaborators::PlainTemplateResolver;
use eventmail_queue::composer::EmailComposer;
use eventmail_queue::dates::{normalize_date, normalize_event_dates, parse_date};
use eventmail_queue::provider::SendReceipt;
use eventmail_queue::rate_limit::{FIXED_DELAY_MS, MAX_JITTER_MS, RATE_LIMIT_BACKOFFS_MS};
use eventmail_queue::workers::{EmailHandler, Mailer};
use eventmail_queue::{
    EmailProvider, EmailType, FixMode, JobOptions, JobPayload, JobState, JobStore, MailQueues,
    MemoryJobStore, PriorityBatchRequest, PriorityDispatcher, ProviderError, Queue, QueueAdmin,
    QueueName, RateLimitPolicy, RateLimiter, Reaper, ReaperConfig, Receiver, RetryOutcome,
    SendRequest, StandardSendRequest, Worker,
};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::Instant;

/// Provider that records when each send went out.
#[derive(Default)]
struct RecordingProvider {
    sends: Mutex<Vec<(Instant, String)>>,
    fail: bool,
}

#[async_trait]
impl EmailProvider for RecordingProvider {
    async fn send(&self, request: &SendRequest) -> Result<SendReceipt, ProviderError> {
        if self.fail {
            return Err(ProviderError::Transport("provider unavailable".into()));
        }
        let mut sends = self.sends.lock().expect("lock");
        sends.push((Instant::now(), request.to.join(",")));
        Ok(SendReceipt {
            id: format!("msg-{}", sends.len()),
        })
    }
}

fn mailer(provider: Arc<RecordingProvider>, policy: RateLimitPolicy) -> Arc<Mailer> {
    Arc::new(Mailer::new(
        EmailComposer::new("events@example.com", Arc::new(PlainTemplateResolver)),
        Arc::new(RateLimiter::new(policy)),
        provider,
    ))
}

fn invitation(email: &str) -> StandardSendRequest {
    let mut receiver = Receiver::new(email);
    receiver.id = Some(email.split('@').next().unwrap_or_default().to_string());
    StandardSendRequest::new(
        receiver,
        json!({"title": "Launch", "startTime": "2026-03-01T18:30:00Z"}),
        EmailType::Invitation,
    )
}

fn memory_queue(name: QueueName) -> (Arc<MemoryJobStore>, Queue) {
    let store = Arc::new(MemoryJobStore::new());
    let queue = Queue::new(name, store.clone() as Arc<dyn JobStore>);
    (store, queue)
}

#[tokio::test(start_paused = true)]
async fn test_email_worker_spaces_sends() {
    let (_store, queue) = memory_queue(QueueName::Email);
    let provider = Arc::new(RecordingProvider::default());
    let handler = EmailHandler::new(mailer(provider.clone(), RateLimitPolicy::default()));
    let worker = Worker::new(queue.clone(), Arc::new(handler), Arc::new(QueueMetrics::new()));

    for i in 0..5 {
        queue
            .enqueue(
                &invitation(&format!("user{i}@example.com")).into(),
                &JobOptions::standard_email(),
            )
            .await
            .expect("enqueue");
    }

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(rx));
    while provider.sends.lock().expect("lock").len() < 5 {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tx.send(true).expect("shutdown");
    handle.await.expect("worker task");

    let sends = provider.sends.lock().expect("lock");
    let recipients: Vec<_> = sends.iter().map(|(_, to)| to.as_str()).collect();
    assert_eq!(
        recipients,
        vec![
            "user0@example.com",
            "user1@example.com",
            "user2@example.com",
            "user3@example.com",
            "user4@example.com"
        ]
    );
    for pair in sends.windows(2) {
        let gap = pair[1].0 - pair[0].0;
        assert!(gap >= Duration::from_millis(FIXED_DELAY_MS), "gap {gap:?} too short");
        assert!(
            gap < Duration::from_millis(FIXED_DELAY_MS + MAX_JITTER_MS),
            "gap {gap:?} too long"
        );
    }
}

#[test]
fn test_backoff_is_monotone_and_capped() {
    let mut previous = Duration::ZERO;
    for attempt in 1..=12 {
        let backoff = RateLimitPolicy::backoff_for(attempt);
        assert!(backoff >= previous, "attempt {attempt} shrank");
        previous = backoff;
    }
    assert_eq!(RateLimitPolicy::backoff_for(8), Duration::from_millis(384_000));
    assert_eq!(RateLimitPolicy::backoff_for(20), Duration::from_millis(384_000));
    assert_eq!(RATE_LIMIT_BACKOFFS_MS.len(), 8);
}

#[tokio::test]
async fn test_reaper_reclaims_ghost_job() {
    let (store, queue) = memory_queue(QueueName::Email);
    let id = queue
        .enqueue_raw(json!({"kind": "standardSend"}), &JobOptions::standard_email())
        .await
        .expect("enqueue");
    queue.fetch_next().await.expect("fetch").expect("job");
    store
        .update_job("email", &id, |job| {
            // Activated 130 s ago by a worker that never heartbeated again.
            let then = Utc::now() - chrono::Duration::milliseconds(130_000);
            job.processed_on = Some(then);
            job.progress_at = Some(then);
        })
        .await;

    let report = Reaper::new(queue.clone(), ReaperConfig::default())
        .sweep()
        .await
        .expect("sweep");
    assert_eq!(report.reclaimed, vec![id.clone()]);

    let job = queue.get_job(&id).await.expect("get").expect("job");
    assert_ne!(job.state, JobState::Active);
    assert_eq!(job.state, JobState::Waiting);
}

#[tokio::test]
async fn test_active_count_never_negative() {
    let metrics = Arc::new(QueueMetrics::new());
    let handles: Vec<_> = (0..50)
        .map(|i| {
            let metrics = metrics.clone();
            tokio::spawn(async move {
                match i % 3 {
                    0 => metrics.record_started(),
                    1 => metrics.record_completed(),
                    _ => metrics.record_failed(),
                }
            })
        })
        .collect();
    for handle in handles {
        handle.await.expect("task");
    }

    let snapshot = metrics.snapshot();
    assert!(snapshot.active_count <= snapshot.total_count);
    assert_eq!(snapshot.total_count, 17);

    for _ in 0..10 {
        metrics.record_completed();
    }
    assert_eq!(metrics.snapshot().active_count, 0);
}

#[tokio::test]
async fn test_priority_fallback_enqueues_every_recipient() {
    let (_store, email_queue) = memory_queue(QueueName::Email);
    let provider = Arc::new(RecordingProvider {
        sends: Mutex::default(),
        fail: true,
    });
    let policy = RateLimitPolicy {
        fixed_delay: Duration::from_millis(1),
        max_jitter: Duration::ZERO,
    };
    let dispatcher = PriorityDispatcher::new(mailer(provider, policy), email_queue.clone());

    let request = PriorityBatchRequest {
        event: json!({"title": "Launch"}),
        creator_id: None,
        proposer_recipients: vec![invitation("p1@example.com"), invitation("p2@example.com")],
        attendee_recipients: (1..=5)
            .map(|i| invitation(&format!("a{i}@example.com")))
            .collect(),
    };
    let report = dispatcher.dispatch(&request).await.expect("fallback succeeds");

    assert!(report.fell_back);
    assert_eq!(report.queued.len(), 7);
    let counts = email_queue.get_counts().await.expect("counts");
    assert_eq!(counts.waiting, 7);
    assert_eq!(counts.total(), 7);
}

#[tokio::test]
async fn test_retry_gate() {
    let (_store, queue) = memory_queue(QueueName::Email);
    let admin = QueueAdmin::new(queue.clone());

    let failed = queue
        .enqueue(
            &invitation("f@example.com").into(),
            &JobOptions::standard_email().with_attempts(1),
        )
        .await
        .expect("enqueue");
    let job = queue.fetch_next().await.expect("fetch").expect("job");
    queue.fail_attempt(&job, "boom", false).await.expect("fail");
    let waiting = queue
        .enqueue(&invitation("w@example.com").into(), &JobOptions::standard_email())
        .await
        .expect("enqueue");

    let before = queue.get_counts().await.expect("counts");
    assert!(matches!(
        admin.retry_job(&waiting).await.expect("retry"),
        RetryOutcome::NotFailed { .. }
    ));
    assert_eq!(queue.get_counts().await.expect("counts"), before);

    assert_eq!(admin.retry_job(&failed).await.expect("retry"), RetryOutcome::Retried);
    let after = queue.get_counts().await.expect("counts");
    assert_eq!(after.failed + 1, before.failed);
    assert_eq!(after.waiting, before.waiting + 1);
}

#[tokio::test]
async fn test_bulk_fix_modes() {
    for mode in [FixMode::Remove, FixMode::Complete, FixMode::Reset] {
        let (_store, queue) = memory_queue(QueueName::Email);
        let admin = QueueAdmin::new(queue.clone());
        let options = JobOptions::batch_email().with_priority(7);
        for i in 0..3 {
            queue
                .enqueue(&invitation(&format!("u{i}@example.com")).into(), &options)
                .await
                .expect("enqueue");
        }
        for _ in 0..3 {
            queue.fetch_next().await.expect("fetch").expect("job");
        }

        let report = admin.fix_stuck_jobs(mode).await.expect("fix");
        assert_eq!(report.fixed.len(), 3);
        let counts = queue.get_counts().await.expect("counts");
        assert_eq!(counts.active, 0);

        match mode {
            FixMode::Remove => assert_eq!(counts.total(), 0),
            FixMode::Complete => assert_eq!(counts.completed, 3),
            FixMode::Reset => {
                assert_eq!(counts.waiting, 3);
                for job in queue
                    .get_jobs_by_state(&[JobState::Waiting], 0, 10)
                    .await
                    .expect("list")
                {
                    assert_eq!(job.options, options);
                }
            }
        }
    }
}

#[test]
fn test_date_normalisation_shapes() {
    let expected = parse_date(&json!("2026-03-01T18:30:00Z")).expect("iso");
    let millis = expected.timestamp_millis();

    assert_eq!(normalize_date(&json!(millis)), expected);
    assert_eq!(normalize_date(&json!(millis.to_string())), expected);
    assert_eq!(normalize_date(&json!({"$date": "2026-03-01T18:30:00.000Z"})), expected);
    assert_eq!(
        normalize_date(&json!({"seconds": expected.timestamp(), "nanoseconds": 0})),
        expected
    );

    let before = Utc::now();
    let fallback = normalize_date(&json!("not a date"));
    assert!(fallback >= before);
    let fallback = normalize_date(&serde_json::Value::Null);
    assert!(fallback >= before);

    let mut event = json!({"startTime": millis, "deletedAt": null, "title": "Launch"});
    normalize_event_dates(&mut event);
    assert_eq!(event["startTime"], expected.to_rfc3339());
    assert!(event["deletedAt"].is_null());
}

#[tokio::test]
async fn test_producer_to_worker_round_trip() {
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let queues = MailQueues::new(store);
    let provider = Arc::new(RecordingProvider::default());
    let policy = RateLimitPolicy {
        fixed_delay: Duration::from_millis(1),
        max_jitter: Duration::ZERO,
    };
    let worker = Worker::new(
        queues.queue(QueueName::Email).clone(),
        Arc::new(EmailHandler::new(mailer(provider.clone(), policy))),
        queues.metrics_for(QueueName::Email),
    );

    let id = queues
        .queue_email(JobPayload::from(invitation("ada@example.com")))
        .await
        .expect("queue");
    let job = queues
        .queue(QueueName::Email)
        .fetch_next()
        .await
        .expect("fetch")
        .expect("job");
    assert_eq!(job.id, id);
    worker.process(job).await;

    let stats = queues.get_queue_stats().await.expect("stats");
    assert_eq!(stats.counts.total(), 0);
    assert_eq!(stats.process_metrics.completed_count, 1);
    assert_eq!(provider.sends.lock().expect("lock").len(), 1);
}
