//! # RPC Backend - Main Entry Point
//!
//! Runs every configured backend server (by default two TravelService and two ReviewService
//! instances) in one process, each registered with discovery.
//!
//! Configuration is read from `BACKEND_CONFIG_PATH` (default `config/backend.yaml`), then
//! `BACKEND_*` environment overrides are applied. Startup failures exit non-zero.

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use thrift_gateway::backend::BackendSupervisor;
use thrift_gateway::core::shutdown::shutdown_signal;
use thrift_gateway::observability::init_logging;
use thrift_gateway::BackendConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("BACKEND_CONFIG_PATH")
        .unwrap_or_else(|_| "config/backend.yaml".to_string());

    let config = BackendConfig::load_from_file(&config_path)
        .await
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    init_logging("rpc-backend", &config.observability.logging)?;
    info!("Starting RPC backend");

    let supervisor = BackendSupervisor::initialize(&config)
        .await
        .context("Backend initialization failed")?;
    info!(servers = supervisor.len(), "Backend servers initialized");

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, stopping servers...");
        signal_shutdown.cancel();
    });

    if let Err(e) = supervisor.run(shutdown).await {
        error!("Backend stopped with error: {}", e);
        return Err(e.into());
    }

    info!("RPC backend shutdown complete");
    Ok(())
}
