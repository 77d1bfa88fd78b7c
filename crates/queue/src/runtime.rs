//! Worker process assembly.

use std::sync::Arc;
use std::time::Duration;

use eventmail_common::config::QueueSettings;
use eventmail_common::{AppResult, Config};
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::broker::BrokerConnection;
use crate::collaborators::{
    CalendarGenerator, ChatNotifier, HttpReminderScheduler, PlainTemplateResolver,
    ReminderScheduler, SlackWebhookNotifier, TemplateResolver, UnconfiguredChatNotifier,
    UnconfiguredReminderScheduler,
};
use crate::composer::EmailComposer;
use crate::dispatcher::PriorityDispatcher;
use crate::producer::MailQueues;
use crate::provider::{EmailProvider, HttpEmailProvider};
use crate::queue::{QueueName, StallDetector};
use crate::rate_limit::{DistributedSlot, RateLimitPolicy, RateLimiter};
use crate::reaper::{Reaper, ReaperConfig};
use crate::store::{JobStore, RedisJobStore};
use crate::workers::{
    EmailHandler, JobHandler, Mailer, NotificationHandler, PriorityHandler, ReminderHandler,
    Worker,
};

/// External services the workers call.
#[derive(Clone)]
pub struct Collaborators {
    pub provider: Arc<dyn EmailProvider>,
    pub templates: Arc<dyn TemplateResolver>,
    pub calendar: Option<Arc<dyn CalendarGenerator>>,
    pub reminders: Arc<dyn ReminderScheduler>,
    pub chat: Arc<dyn ChatNotifier>,
}

impl Collaborators {
    /// HTTP adapters for everything configured; unconfigured reminder and chat
    /// services fail their jobs instead of dropping them.
    pub fn from_config(config: &Config) -> AppResult<Self> {
        let reminders: Arc<dyn ReminderScheduler> = match &config.reminders {
            Some(settings) => Arc::new(HttpReminderScheduler::new(settings)?),
            None => Arc::new(UnconfiguredReminderScheduler),
        };
        let chat: Arc<dyn ChatNotifier> = match &config.slack {
            Some(settings) => Arc::new(SlackWebhookNotifier::new(settings)?),
            None => Arc::new(UnconfiguredChatNotifier),
        };

        Ok(Self {
            provider: Arc::new(HttpEmailProvider::new(&config.email)?),
            templates: Arc::new(PlainTemplateResolver),
            calendar: None,
            reminders,
            chat,
        })
    }
}

/// Workers, stall detectors and reapers for every lane.
pub struct WorkerRuntime {
    queues: Arc<MailQueues>,
    mailer: Arc<Mailer>,
    collaborators: Collaborators,
    settings: QueueSettings,
    direct_attendee_cap: usize,
}

impl WorkerRuntime {
    #[must_use]
    pub fn new(
        config: &Config,
        store: Arc<dyn JobStore>,
        limiter: Arc<RateLimiter>,
        collaborators: Collaborators,
    ) -> Self {
        let mut composer = EmailComposer::new(
            config.email.from_address.clone(),
            Arc::clone(&collaborators.templates),
        );
        if let Some(calendar) = &collaborators.calendar {
            composer = composer.with_calendar(Arc::clone(calendar));
        }
        let mailer = Arc::new(Mailer::new(
            composer,
            limiter,
            Arc::clone(&collaborators.provider),
        ));

        Self {
            queues: Arc::new(MailQueues::new(store)),
            mailer,
            collaborators,
            settings: config.queue.clone(),
            direct_attendee_cap: config.dispatch.direct_attendee_cap,
        }
    }

    /// Runtime backed by the broker, with the rate limiter the configuration asks for.
    pub fn from_broker(config: &Config, broker: &BrokerConnection) -> AppResult<Self> {
        let mut limiter = RateLimiter::new(RateLimitPolicy::from(&config.rate_limit));
        if config.rate_limit.distributed {
            limiter = limiter.with_distributed_slot(DistributedSlot::new(
                broker.client(),
                broker.prefix(),
                Duration::from_millis(config.rate_limit.provider_interval_ms),
            ));
        }

        Ok(Self::new(
            config,
            Arc::new(RedisJobStore::new(broker)),
            Arc::new(limiter),
            Collaborators::from_config(config)?,
        ))
    }

    #[must_use]
    pub fn queues(&self) -> Arc<MailQueues> {
        Arc::clone(&self.queues)
    }

    fn handler(&self, name: QueueName) -> Arc<dyn JobHandler> {
        match name {
            QueueName::Email => Arc::new(EmailHandler::new(Arc::clone(&self.mailer))),
            QueueName::PriorityEmail => {
                let dispatcher = PriorityDispatcher::new(
                    Arc::clone(&self.mailer),
                    self.queues.queue(QueueName::Email).clone(),
                )
                .with_direct_attendee_cap(self.direct_attendee_cap);
                Arc::new(PriorityHandler::new(Arc::new(dispatcher)))
            }
            QueueName::ReminderScheduling => Arc::new(ReminderHandler::new(Arc::clone(
                &self.collaborators.reminders,
            ))),
            QueueName::SlackNotification => Arc::new(NotificationHandler::new(Arc::clone(
                &self.collaborators.chat,
            ))),
        }
    }

    /// Spawn every background task, then wait for all of them to stop after
    /// `shutdown` flips.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let poll_interval = Duration::from_millis(self.settings.poll_interval_ms);
        let heartbeat_interval = Duration::from_millis(self.settings.heartbeat_interval_ms);
        let lock_duration = Duration::from_millis(self.settings.lock_duration_ms);
        let stall_check_interval = Duration::from_millis(self.settings.stall_check_interval_ms);
        let reaper_config = ReaperConfig::from(&self.settings);

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        for name in QueueName::ALL {
            let queue = self.queues.queue(name).clone();

            let worker = Worker::new(queue.clone(), self.handler(name), self.queues.metrics_for(name))
                .with_poll_interval(poll_interval)
                .with_heartbeat_interval(heartbeat_interval);
            tasks.push(tokio::spawn(worker.run(shutdown.clone())));

            let detector = StallDetector::new(queue.clone(), lock_duration, stall_check_interval);
            tasks.push(tokio::spawn(detector.run(shutdown.clone())));

            let reaper = Reaper::new(queue, reaper_config);
            tasks.push(tokio::spawn(reaper.run(shutdown.clone())));
        }

        info!(tasks = tasks.len(), "Worker runtime started");

        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!(error = %e, "Background task ended abnormally");
            }
        }

        info!("Worker runtime stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::jobs::{EmailType, Receiver, SendRequest, StandardSendRequest};
    use crate::provider::{ProviderError, SendReceipt};
    use crate::store::MemoryJobStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingProvider(AtomicUsize);

    #[async_trait]
    impl EmailProvider for CountingProvider {
        async fn send(&self, _request: &SendRequest) -> Result<SendReceipt, ProviderError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(SendReceipt {
                id: format!("msg-{n}"),
            })
        }
    }

    #[tokio::test]
    async fn test_runtime_processes_email_and_stops() {
        let mut config = Config::with_redis_url("redis://localhost:6379").unwrap();
        config.queue.poll_interval_ms = 10;
        let provider = Arc::new(CountingProvider::default());
        let collaborators = Collaborators {
            provider: provider.clone(),
            templates: Arc::new(PlainTemplateResolver),
            calendar: None,
            reminders: Arc::new(UnconfiguredReminderScheduler),
            chat: Arc::new(UnconfiguredChatNotifier),
        };
        let limiter = RateLimiter::new(RateLimitPolicy {
            fixed_delay: Duration::from_millis(1),
            max_jitter: Duration::ZERO,
        });
        let runtime = WorkerRuntime::new(
            &config,
            Arc::new(MemoryJobStore::new()),
            Arc::new(limiter),
            collaborators,
        );
        let queues = runtime.queues();
        queues
            .queue_email(StandardSendRequest::new(
                Receiver::new("ada@example.com"),
                serde_json::json!({"title": "Launch"}),
                EmailType::Invitation,
            ))
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(runtime.run(rx));
        while provider.0.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap();

        let stats = queues.get_queue_stats().await.unwrap();
        assert_eq!(stats.process_metrics.completed_count, 1);
        assert_eq!(stats.counts.total(), 0);
    }
}
