//! Common utilities and shared types for eventmail.
//!
//! This crate provides foundational components used across all eventmail crates:
//!
//! - **Configuration**: Application settings via [`Config`]
//! - **Error handling**: Unified error types via [`AppError`] and [`AppResult`]
//! - **Metrics**: Per-queue process counters via [`QueueMetrics`]
//!
//! # Example
//!
//! ```no_run
//! use eventmail_common::{Config, AppResult};
//!
//! fn example() -> AppResult<()> {
//!     let config = Config::load()?;
//!     println!("Broker prefix: {}", config.redis.prefix);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod metrics;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use metrics::{ProcessMetrics, QueueMetrics};
