//! QAFlow Daemon
//!
//! Orchestrates test-generation workflows across the QAFlow services.

use clap::Parser;
use qaflow_common::Database;
use qaflow_engine::{
    spawn_retention, BatchCoordinator, MemoryWorkflowStore, RateLimiter, ServiceHealthAggregator,
    SqliteCounterStore, WorkflowCoordinator,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod remote;
mod server;

use config::DaemonConfig;

#[derive(Parser)]
#[command(name = "qaflowd")]
#[command(about = "QAFlow daemon - design and requirements to UI tests")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Store directory
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// HTTP listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(cli.json_logs.then(|| fmt::layer().json()))
        .with((!cli.json_logs).then(fmt::layer))
        .with(filter)
        .init();

    info!("QAFlow daemon v{}", qaflow_common::VERSION);

    // Load configuration, then let flags override it
    let config_path = cli.config.unwrap_or_else(qaflow_common::default_config_path);
    let mut config = DaemonConfig::load(&config_path)?;
    config.apply_env();
    if let Some(store) = cli.store {
        config.storage.store_path = store;
    }
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    config.validate()?;
    let addr = config.listen_addr()?;

    // Ensure store directory exists
    tokio::fs::create_dir_all(&config.storage.store_path).await?;

    let mut limiter = RateLimiter::new(config.rate_limits.clone());
    if config.storage.shared_counters {
        let db = Database::open(config.db_path())?;
        limiter = limiter.with_shared_store(Arc::new(SqliteCounterStore::new(db)));
        info!("Rate limit counters shared via {}", config.db_path().display());
    } else {
        warn!("Rate limit counters are process-local");
    }

    if config.clients.design_token.is_none() {
        warn!(
            "No design API token configured; set {} to enable design analysis",
            config::DESIGN_TOKEN_ENV
        );
    }

    let health = ServiceHealthAggregator::new(&config.services)?;
    let clients = remote::build_clients(&config.clients)?;
    let parser = clients.parser.clone();

    let store = Arc::new(MemoryWorkflowStore::new());
    let coordinator = WorkflowCoordinator::new(
        store.clone(),
        clients,
        limiter.clone(),
        config.workflow.clone(),
    )
    .with_health(health.clone());

    // Start retention sweeper
    let retention_handle = spawn_retention(
        store,
        config.workflow.retention(),
        config.workflow.sweep_interval(),
    );

    // Start HTTP server
    let state = server::AppState {
        coordinator,
        limiter,
        health,
        batch: BatchCoordinator::from_limit(config.workflow.batch_concurrency),
        parser,
    };
    let server_handle = tokio::spawn(server::serve(addr, server::router(state)));

    info!("Daemon started on http://{}", addr);

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Err(e)) => tracing::error!("HTTP server error: {}", e),
                Err(e) => tracing::error!("HTTP server task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
        result = retention_handle => {
            if let Err(e) = result {
                tracing::error!("Retention task failed: {}", e);
            }
        }
    }

    info!("Daemon shutdown complete");
    Ok(())
}
