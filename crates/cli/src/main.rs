//! Operator commands for the eventmail queues.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use eventmail_common::Config;
use eventmail_queue::admin::ProcessOutcome;
use eventmail_queue::{
    BrokerConnection, FixMode, HttpEmailProvider, JobStore, JobView, MailQueues, QueueAdmin,
    QueueName, RedisJobStore, RetryOutcome, WorkerRuntime,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "eventmail-admin", version, about = "Inspect and repair eventmail queues")]
struct Cli {
    /// Queue to operate on
    #[arg(long, global = true, default_value = "email")]
    queue: QueueName,

    /// Configuration file; defaults to config/ and the environment
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Write logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List jobs in one state, or `all`
    ShowJobs {
        #[arg(default_value = "all")]
        view: JobView,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Move jobs active for longer than the threshold back to waiting
    ResetActive {
        #[arg(long, default_value_t = 30)]
        threshold_secs: u64,
    },

    /// Apply reset, complete or remove to every active job
    FixStuck { mode: FixMode },

    /// Remove every job and clear the queue's stats
    ResetQueue,

    /// Send one waiting or failed job by hand
    ProcessJob { id: String },

    /// Move one failed job back to waiting
    RetryJob { id: String },

    /// Run the workers until interrupted
    StartWorker,

    /// Print job counts for every queue
    Stats,

    /// Ping the broker
    Health,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "eventmail_queue=info,eventmail_admin=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn load_config(path: Option<&Path>) -> eventmail_common::AppResult<Config> {
    match path {
        Some(path) => Config::from_file(path),
        None => Config::load(),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(
    command: Commands,
    queue_name: QueueName,
    config: &Config,
    broker: &BrokerConnection,
) -> anyhow::Result<ExitCode> {
    let store: Arc<dyn JobStore> = Arc::new(RedisJobStore::new(broker));
    let queues = MailQueues::new(store);
    let admin = QueueAdmin::new(queues.queue(queue_name).clone());

    match command {
        Commands::ShowJobs { view, limit } => {
            let jobs = admin.show_jobs(view, limit).await?;
            print_json(&jobs)?;
        }

        Commands::ResetActive { threshold_secs } => {
            let report = admin
                .reset_active_jobs(Duration::from_secs(threshold_secs))
                .await?;
            print_json(&report)?;
        }

        Commands::FixStuck { mode } => {
            let report = admin.fix_stuck_jobs(mode).await?;
            print_json(&report)?;
            if !report.errors.is_empty() {
                return Ok(ExitCode::FAILURE);
            }
        }

        Commands::ResetQueue => {
            let report = admin.reset_queue().await?;
            print_json(&report)?;
        }

        Commands::ProcessJob { id } => {
            let provider = HttpEmailProvider::new(&config.email)
                .context("email provider is not configured")?;
            let outcome = admin.process_job(&id, &provider).await?;
            print_json(&outcome)?;
            if outcome == ProcessOutcome::NotFound {
                return Ok(ExitCode::FAILURE);
            }
        }

        Commands::RetryJob { id } => {
            let outcome = admin.retry_job(&id).await?;
            print_json(&outcome)?;
            if outcome == RetryOutcome::NotFound {
                return Ok(ExitCode::FAILURE);
            }
        }

        Commands::StartWorker => {
            let runtime = WorkerRuntime::from_broker(config, broker)?;
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let handle = tokio::spawn(runtime.run(shutdown_rx));

            tokio::signal::ctrl_c()
                .await
                .context("failed to install Ctrl+C handler")?;
            info!("Received SIGINT, stopping workers...");
            let _ = shutdown_tx.send(true);
            handle.await.context("worker runtime panicked")?;
        }

        Commands::Stats => {
            let mut counts = BTreeMap::new();
            for name in QueueName::ALL {
                counts.insert(name.as_str(), queues.stats(name).await?.counts);
            }
            print_json(&counts)?;
        }

        Commands::Health => {
            if broker.health_check().await {
                println!("healthy");
            } else {
                println!("unhealthy");
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let broker = match BrokerConnection::connect(&config.redis).await {
        Ok(broker) => broker,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let code = match run(cli.command, cli.queue, &config, &broker).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    };

    broker.shutdown().await;
    code
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use clap::CommandFactory;
    use eventmail_queue::JobState;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["eventmail-admin", "show-jobs"]).unwrap();
        assert_eq!(cli.queue, QueueName::Email);
        match cli.command {
            Commands::ShowJobs { view, limit } => {
                assert_eq!(view, JobView::All);
                assert_eq!(limit, 20);
            }
            _ => panic!("expected show-jobs"),
        }
    }

    #[test]
    fn test_parses_queue_and_state() {
        let cli = Cli::try_parse_from([
            "eventmail-admin",
            "show-jobs",
            "failed",
            "--queue",
            "priority-email",
        ])
        .unwrap();
        assert_eq!(cli.queue, QueueName::PriorityEmail);
        assert!(matches!(
            cli.command,
            Commands::ShowJobs {
                view: JobView::State(JobState::Failed),
                ..
            }
        ));
    }

    #[test]
    fn test_fix_mode_is_validated() {
        let cli = Cli::try_parse_from(["eventmail-admin", "fix-stuck", "remove"]).unwrap();
        assert!(matches!(cli.command, Commands::FixStuck { mode: FixMode::Remove }));
        assert!(Cli::try_parse_from(["eventmail-admin", "fix-stuck", "explode"]).is_err());
    }

    #[test]
    fn test_reset_active_threshold() {
        let cli =
            Cli::try_parse_from(["eventmail-admin", "reset-active", "--threshold-secs", "120"])
                .unwrap();
        assert!(matches!(
            cli.command,
            Commands::ResetActive { threshold_secs: 120 }
        ));
    }
}
