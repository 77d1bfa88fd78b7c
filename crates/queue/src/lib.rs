//! Email job queue for eventmail.
//!
//! This crate delivers transactional email and related notifications through
//! durable, broker-backed queues:
//!
//! - **Broker**: Shared Redis connection with reconnects and graceful shutdown
//! - **Queues**: One lane per job family, with retries, backoff, priority and pause
//! - **Workers**: Bounded-concurrency job execution with heartbeats
//! - **Rate limiting**: Fixed spacing of provider calls, optionally broker-wide
//! - **Reaper**: Reclaims jobs left active by dead workers
//! - **Priority dispatch**: Direct sends ahead of the backlog, with queue fallback
//! - **Admin**: Idempotent operator repair commands
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use eventmail_common::AppResult;
//! use eventmail_queue::{EmailType, MailQueues, MemoryJobStore, Receiver, StandardSendRequest};
//!
//! async fn example() -> AppResult<()> {
//!     let queues = MailQueues::new(Arc::new(MemoryJobStore::new()));
//!     let request = StandardSendRequest::new(
//!         Receiver::new("ada@example.com"),
//!         serde_json::json!({"title": "Launch"}),
//!         EmailType::Invitation,
//!     );
//!     let id = queues.queue_email(request).await?;
//!     println!("queued {id}");
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod broker;
pub mod collaborators;
pub mod composer;
pub mod dates;
pub mod dispatcher;
pub mod heartbeat;
pub mod job;
pub mod jobs;
pub mod producer;
pub mod provider;
pub mod queue;
pub mod rate_limit;
pub mod reaper;
pub mod retry;
pub mod runtime;
pub mod store;
pub mod workers;

pub use admin::{FixMode, JobSummary, JobView, QueueAdmin, RetryOutcome};
pub use broker::BrokerConnection;
pub use dispatcher::{DispatchReport, PriorityDispatcher};
pub use job::{Job, JobCounts, JobOptions, JobState};
pub use jobs::*;
pub use producer::{MailQueues, QueueStats};
pub use provider::{EmailProvider, HttpEmailProvider, ProviderError};
pub use queue::{Queue, QueueEvent, QueueName, StallDetector};
pub use rate_limit::{RateLimitPolicy, RateLimiter};
pub use reaper::{Reaper, ReaperConfig};
pub use retry::Backoff;
pub use runtime::{Collaborators, WorkerRuntime};
pub use store::{JobStore, MemoryJobStore, RedisJobStore};
pub use workers::{JobError, JobHandler, Worker};
