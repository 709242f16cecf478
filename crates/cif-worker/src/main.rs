//! CIF Worker - observable processing process

use anyhow::{Context, Result};
use cif_common::logging::{init_logging, LogConfig, LogLevel};
use cif_worker::cli::Cli;
use cif_worker::{
    AmqpBroker, BackendRegistry, Broker, EnrichmentRegistry, MemoryBroker, WorkerConfig,
    WorkerProcess,
};
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over the flag
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("cif-worker")
        .filter_directives("cif_worker=debug,lapin=warn")
        .include_thread_names(true)
        .build()
        .merge_env()?;
    let _log_guard = init_logging(&log_config)?;

    let config = cli.apply(WorkerConfig::load()?);
    let backends = BackendRegistry::builtin();
    let enrichment = EnrichmentRegistry::builtin();
    config
        .validate(&backends, &enrichment)
        .context("Invalid worker configuration")?;

    let broker: Arc<dyn Broker> = if config.mq_uri.starts_with("memory://") {
        info!("Using in-process broker");
        Arc::new(MemoryBroker::new())
    } else {
        Arc::new(AmqpBroker::new(&config.mq_uri))
    };

    let mut worker = WorkerProcess::start(&config, &backends, &enrichment, broker)
        .with_context(|| format!("Failed to start worker {}", config.name))?;

    let shutdown = CancellationToken::new();
    let supervisor_shutdown = shutdown.clone();
    let supervisor = tokio::task::spawn_blocking(move || {
        worker.run(&supervisor_shutdown);
        worker
    });

    shutdown_signal().await;
    shutdown.cancel();

    let worker = supervisor.await.context("Supervisor task failed")?;
    info!(worker = %worker.name(), restarts = worker.restarts(), "Worker shut down gracefully");
    Ok(())
}

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
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, draining consumers"),
        _ = terminate => info!("Received terminate signal, draining consumers"),
    }
}
