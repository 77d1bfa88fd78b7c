//! Shared broker connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use eventmail_common::config::RedisConfig;
use eventmail_common::{AppError, AppResult};
use fred::clients::Client;
use fred::interfaces::{ClientLike, EventInterface, KeysInterface};
use fred::types::config::{Config as FredConfig, ReconnectPolicy};
use tracing::{debug, info, warn};

/// Reconnect attempts before fred gives up (0 = forever).
const RECONNECT_MAX_ATTEMPTS: u32 = 0;
const RECONNECT_MIN_DELAY_MS: u32 = 100;
const RECONNECT_MAX_DELAY_MS: u32 = 30_000;

/// Connection to the broker, shared by every queue in the process.
#[derive(Clone)]
pub struct BrokerConnection {
    client: Arc<Client>,
    prefix: String,
    closed: Arc<AtomicBool>,
}

impl BrokerConnection {
    /// Connect to the broker.
    ///
    /// Fails with [`AppError::Config`] when the URL is missing or malformed, and with
    /// [`AppError::Broker`] when the initial connection cannot be established.
    pub async fn connect(config: &RedisConfig) -> AppResult<Self> {
        if config.url.trim().is_empty() {
            return Err(AppError::Config(
                "broker connection URL is not configured".to_string(),
            ));
        }

        let fred_config = FredConfig::from_url(&config.url)
            .map_err(|e| AppError::Config(format!("invalid broker URL: {e}")))?;
        let policy = ReconnectPolicy::new_exponential(
            RECONNECT_MAX_ATTEMPTS,
            RECONNECT_MIN_DELAY_MS,
            RECONNECT_MAX_DELAY_MS,
            2,
        );

        let client = Client::new(fred_config, None, None, Some(policy));
        client
            .init()
            .await
            .map_err(|e| AppError::Broker(format!("failed to connect to broker: {e}")))?;

        // Connection errors are reported here and handled by the reconnect policy.
        let mut errors = client.error_rx();
        tokio::spawn(async move {
            while let Ok(event) = errors.recv().await {
                warn!(?event, "Broker connection error");
            }
            debug!("Broker error stream ended");
        });

        info!(prefix = %config.prefix, "Connected to broker");

        Ok(Self {
            client: Arc::new(client),
            prefix: config.prefix.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The underlying client.
    #[must_use]
    pub fn client(&self) -> Arc<Client> {
        Arc::clone(&self.client)
    }

    /// Key prefix for every queue key.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether the broker answers a round-trip. Never errors.
    pub async fn health_check(&self) -> bool {
        if self.closed.load(Ordering::Acquire) || !self.client.is_connected() {
            return false;
        }

        let key = format!("{}:health", self.prefix);
        match self.client.exists::<i64, _>(key).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Broker health check failed");
                false
            }
        }
    }

    /// Close the connection gracefully. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        match self.client.quit().await {
            Ok(()) => info!("Broker connection closed"),
            Err(e) => warn!(error = %e, "Broker connection did not close cleanly"),
        }
    }
}
