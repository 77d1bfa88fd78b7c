//! Application configuration.

use serde::Deserialize;
use std::path::Path;

use crate::error::{AppError, AppResult};

/// Environment variable that carries the broker connection URL.
pub const REDIS_URL_ENV: &str = "REDIS_URL";

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Redis (broker) configuration.
    pub redis: RedisConfig,
    /// Email provider configuration.
    #[serde(default)]
    pub email: EmailSettings,
    /// Send-rate limiting.
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    /// Worker, stall detection and reaper timings.
    #[serde(default)]
    pub queue: QueueSettings,
    /// Priority dispatch settings.
    #[serde(default)]
    pub dispatch: DispatchSettings,
    /// Slack notifications (optional).
    #[serde(default)]
    pub slack: Option<SlackSettings>,
    /// Reminder scheduling callback (optional).
    #[serde(default)]
    pub reminders: Option<ReminderSettings>,
}

/// Redis configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL.
    #[serde(default)]
    pub url: String,
    /// Key prefix for all Redis keys.
    #[serde(default = "default_redis_prefix")]
    pub prefix: String,
}

/// Transactional email provider settings.
#[derive(Debug, Clone, Deserialize)]
pub struct EmailSettings {
    /// Base URL of the provider HTTP API.
    #[serde(default = "default_email_api_url")]
    pub api_url: String,
    /// API key sent as a bearer token.
    #[serde(default)]
    pub api_key: String,
    /// Sender address used for every message.
    #[serde(default = "default_from_address")]
    pub from_address: String,
}

/// Send-rate limiting settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    /// Fixed delay before every provider call.
    #[serde(default = "default_fixed_delay_ms")]
    pub fixed_delay_ms: u64,
    /// Upper bound (exclusive) of the random jitter added to the fixed delay.
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
    /// Also take a broker-wide slot before each send.
    #[serde(default)]
    pub distributed: bool,
    /// Minimum spacing of provider calls across all processes.
    #[serde(default = "default_provider_interval_ms")]
    pub provider_interval_ms: u64,
}

/// Worker, stall detection and reaper timings.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    /// Idle sleep between empty polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Heartbeat period while a job runs.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// How often the stall detector scans active jobs.
    #[serde(default = "default_stall_check_interval_ms")]
    pub stall_check_interval_ms: u64,
    /// Heartbeat age after which an active job is flagged stalled.
    #[serde(default = "default_lock_duration_ms")]
    pub lock_duration_ms: u64,
    /// Active age after which a job counts as a ghost.
    #[serde(default = "default_ghost_threshold_ms")]
    pub ghost_threshold_ms: u64,
    /// Period of the reaper's sweep.
    #[serde(default = "default_reaper_interval_ms")]
    pub reaper_interval_ms: u64,
    /// Wait after a stall notification before scanning.
    #[serde(default = "default_stall_grace_ms")]
    pub stall_grace_ms: u64,
}

/// Priority dispatch settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchSettings {
    /// Attendees sent synchronously before the rest is queued.
    #[serde(default = "default_direct_attendee_cap")]
    pub direct_attendee_cap: usize,
}

/// Slack incoming-webhook settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SlackSettings {
    /// Incoming webhook URL.
    pub webhook_url: String,
}

/// Reminder scheduling callback settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ReminderSettings {
    /// Endpoint of the host application that persists reminders.
    pub callback_url: String,
    /// Shared secret sent in the `Authorization` header.
    #[serde(default)]
    pub secret: Option<String>,
}

fn default_redis_prefix() -> String {
    "eventmail".to_string()
}

fn default_email_api_url() -> String {
    "https://api.resend.com".to_string()
}

fn default_from_address() -> String {
    "Events <events@example.com>".to_string()
}

const fn default_fixed_delay_ms() -> u64 {
    1700
}

const fn default_max_jitter_ms() -> u64 {
    300
}

const fn default_provider_interval_ms() -> u64 {
    500
}

const fn default_poll_interval_ms() -> u64 {
    1000
}

const fn default_heartbeat_interval_ms() -> u64 {
    5000
}

const fn default_stall_check_interval_ms() -> u64 {
    30_000
}

const fn default_lock_duration_ms() -> u64 {
    30_000
}

const fn default_ghost_threshold_ms() -> u64 {
    120_000
}

const fn default_reaper_interval_ms() -> u64 {
    300_000
}

const fn default_stall_grace_ms() -> u64 {
    5000
}

const fn default_direct_attendee_cap() -> usize {
    10
}

impl Default for EmailSettings {
    fn default() -> Self {
        Self {
            api_url: default_email_api_url(),
            api_key: String::new(),
            from_address: default_from_address(),
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            fixed_delay_ms: default_fixed_delay_ms(),
            max_jitter_ms: default_max_jitter_ms(),
            distributed: false,
            provider_interval_ms: default_provider_interval_ms(),
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            stall_check_interval_ms: default_stall_check_interval_ms(),
            lock_duration_ms: default_lock_duration_ms(),
            ghost_threshold_ms: default_ghost_threshold_ms(),
            reaper_interval_ms: default_reaper_interval_ms(),
            stall_grace_ms: default_stall_grace_ms(),
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            direct_attendee_cap: default_direct_attendee_cap(),
        }
    }
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `.env` (if present)
    /// 2. `config/default.toml`
    /// 3. `config/{environment}.toml` (based on `EVENTMAIL_ENV`)
    /// 4. Environment variables with `EVENTMAIL_` prefix
    /// 5. `REDIS_URL`
    ///
    /// Fails with [`AppError::Config`] when no broker URL is configured.
    pub fn load() -> AppResult<Self> {
        let _ = dotenvy::dotenv();
        let env = std::env::var("EVENTMAIL_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("EVENTMAIL")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("redis.url", std::env::var(REDIS_URL_ENV).ok())?
            .build()?;

        Self::from_source(config)
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("EVENTMAIL")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("redis.url", std::env::var(REDIS_URL_ENV).ok())?
            .build()?;

        Self::from_source(config)
    }

    fn from_source(source: config::Config) -> AppResult<Self> {
        let url = source.get_string("redis.url").unwrap_or_default();
        if url.trim().is_empty() {
            return Err(AppError::Config(format!(
                "{REDIS_URL_ENV} is not set; the broker connection URL is required"
            )));
        }

        let config: Self = source.try_deserialize()?;
        Ok(config)
    }

    /// Build a configuration for the given broker URL with every other setting at its default.
    pub fn with_redis_url(url: impl Into<String>) -> AppResult<Self> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(AppError::Config(format!(
                "{REDIS_URL_ENV} is not set; the broker connection URL is required"
            )));
        }

        Ok(Self {
            redis: RedisConfig {
                url,
                prefix: default_redis_prefix(),
            },
            email: EmailSettings::default(),
            rate_limit: RateLimitSettings::default(),
            queue: QueueSettings::default(),
            dispatch: DispatchSettings::default(),
            slack: None,
            reminders: None,
        })
    }
}
