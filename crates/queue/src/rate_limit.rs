//! Send-rate limiting for the email provider.
//!
//! The provider accepts at most two requests per second. Every send waits a fixed
//! delay plus jitter, and retried sends add an escalating backoff on top. The wait
//! is unconditional: elapsed time since the previous send is never subtracted.

use std::sync::Arc;
use std::time::Duration;

use eventmail_common::config::RateLimitSettings;
use eventmail_common::{AppError, AppResult};
use fred::clients::Client;
use fred::interfaces::KeysInterface;
use fred::types::{Expiration, SetOptions};
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};
use uuid::Uuid;

/// Extra wait for retried sends, indexed by `attempt - 1` and capped at the last entry.
pub const RATE_LIMIT_BACKOFFS_MS: [u64; 8] =
    [3000, 6000, 12_000, 24_000, 48_000, 96_000, 192_000, 384_000];

/// Wait before every send.
pub const FIXED_DELAY_MS: u64 = 1700;

/// Exclusive upper bound of the random jitter.
pub const MAX_JITTER_MS: u64 = 300;

/// Delay arithmetic, separate from the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub fixed_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            fixed_delay: Duration::from_millis(FIXED_DELAY_MS),
            max_jitter: Duration::from_millis(MAX_JITTER_MS),
        }
    }
}

impl From<&RateLimitSettings> for RateLimitPolicy {
    fn from(settings: &RateLimitSettings) -> Self {
        Self {
            fixed_delay: Duration::from_millis(settings.fixed_delay_ms),
            max_jitter: Duration::from_millis(settings.max_jitter_ms),
        }
    }
}

impl RateLimitPolicy {
    /// Backoff contribution for `attempt`; zero for a first send.
    #[must_use]
    pub fn backoff_for(attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let index = (attempt as usize - 1).min(RATE_LIMIT_BACKOFFS_MS.len() - 1);
        Duration::from_millis(RATE_LIMIT_BACKOFFS_MS[index])
    }

    /// Total wait for `attempt` with a given jitter.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, jitter: Duration) -> Duration {
        self.fixed_delay + jitter + Self::backoff_for(attempt)
    }

    /// Random jitter in `[0, max_jitter)`.
    #[must_use]
    pub fn jitter(&self) -> Duration {
        let max = self.max_jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..max))
    }
}

/// Broker-wide send slot, so the provider ceiling holds across processes.
///
/// A slot is a key set with `NX` and a `PX` expiry equal to the minimum spacing of
/// provider calls; whoever sets it may send.
#[derive(Clone)]
pub struct DistributedSlot {
    client: Arc<Client>,
    key: String,
    interval: Duration,
    owner: String,
}

impl DistributedSlot {
    #[must_use]
    pub fn new(client: Arc<Client>, prefix: &str, interval: Duration) -> Self {
        Self {
            client,
            key: format!("{prefix}:rate-limit:provider"),
            interval,
            owner: Uuid::new_v4().to_string(),
        }
    }

    /// Try to take the slot once.
    pub async fn try_acquire(&self) -> AppResult<bool> {
        let ttl_ms = self.interval.as_millis().max(1) as i64;
        let result: Option<String> = self
            .client
            .set(
                self.key.clone(),
                self.owner.clone(),
                Some(Expiration::PX(ttl_ms)),
                Some(SetOptions::NX),
                false,
            )
            .await
            .map_err(|e| AppError::Broker(format!("failed to take send slot: {e}")))?;

        // NX returns None if another process holds the slot.
        Ok(result.is_some())
    }

    /// Wait until the slot is ours. Broker errors give up on the slot rather than block sends.
    pub async fn acquire(&self) {
        let poll = (self.interval / 4).max(Duration::from_millis(10));
        loop {
            match self.try_acquire().await {
                Ok(true) => return,
                Ok(false) => sleep(poll).await,
                Err(e) => {
                    warn!(error = %e, "Distributed send slot unavailable; relying on local pacing");
                    return;
                }
            }
        }
    }
}

/// Serialized gate in front of every provider call.
pub struct RateLimiter {
    policy: RateLimitPolicy,
    last_send: Mutex<Option<Instant>>,
    slot: Option<DistributedSlot>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitPolicy::default())
    }
}

impl RateLimiter {
    #[must_use]
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy,
            last_send: Mutex::new(None),
            slot: None,
        }
    }

    /// Also take a broker-wide slot after the local wait.
    #[must_use]
    pub fn with_distributed_slot(mut self, slot: DistributedSlot) -> Self {
        self.slot = Some(slot);
        self
    }

    #[must_use]
    pub const fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Wait before a send. `attempt` is zero for a first send.
    ///
    /// Callers are served one at a time; the wait is never shortened by time already
    /// elapsed. Returns how long this call slept.
    pub async fn rate_limit(&self, attempt: u32) -> Duration {
        let mut last_send = self.last_send.lock().await;

        let jitter = self.policy.jitter();
        let delay = self.policy.delay_for(attempt, jitter);
        debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            jitter_ms = jitter.as_millis() as u64,
            "Rate limiting send"
        );
        sleep(delay).await;

        if let Some(slot) = &self.slot {
            slot.acquire().await;
        }

        *last_send = Some(Instant::now());
        delay
    }

    /// When the previous send was released, if any.
    pub async fn last_send(&self) -> Option<Instant> {
        *self.last_send.lock().await
    }

    /// Earliest time the next first-attempt send can go out.
    pub async fn next_allowed(&self) -> Option<Instant> {
        self.last_send()
            .await
            .map(|last| last + self.policy.fixed_delay)
    }
}
