//! eventmail worker entry point.

use std::process::ExitCode;

use eventmail_common::Config;
use eventmail_queue::{BrokerConnection, WorkerRuntime};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Emit JSON log lines when set to a non-empty value.
const JSON_LOGS_ENV: &str = "EVENTMAIL_LOG_JSON";

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "eventmail=info,eventmail_queue=info".into());
    let json = std::env::var(JSON_LOGS_ENV).is_ok_and(|v| !v.is_empty());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
///
/// On Unix systems, this listens for both SIGINT (Ctrl+C) and SIGTERM.
/// On Windows, this only listens for Ctrl+C.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT, initiating graceful shutdown...");
        },
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    info!("Starting eventmail worker...");

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    info!("Connecting to broker...");
    let broker = match BrokerConnection::connect(&config.redis).await {
        Ok(broker) => broker,
        Err(e) => {
            error!(error = %e, "Failed to connect to broker");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match WorkerRuntime::from_broker(&config, &broker) {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to build worker runtime");
            broker.shutdown().await;
            return ExitCode::FAILURE;
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut runtime = tokio::spawn(runtime.run(shutdown_rx));

    let finished = tokio::select! {
        () = shutdown_signal() => None,
        result = &mut runtime => Some(result),
    };
    let result = match finished {
        Some(result) => result,
        None => {
            let _ = shutdown_tx.send(true);
            runtime.await
        }
    };
    if let Err(e) = result {
        warn!(error = %e, "Worker runtime ended abnormally");
    }

    broker.shutdown().await;
    info!("Worker shutdown complete");
    ExitCode::SUCCESS
}
