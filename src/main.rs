//! # Thrift Gateway - Main Entry Point
//!
//! Accepts `POST /proxy/{service}/{method}` JSON requests and relays them as generic RPC
//! calls to backends found through service discovery.
//!
//! Configuration is read from `GATEWAY_CONFIG_PATH` (default `config/gateway.yaml`), then
//! `GATEWAY_*` environment overrides are applied.

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use thrift_gateway::core::shutdown::shutdown_signal;
use thrift_gateway::observability::init_logging;
use thrift_gateway::{GatewayConfig, GatewayServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("GATEWAY_CONFIG_PATH")
        .unwrap_or_else(|_| "config/gateway.yaml".to_string());

    let config = GatewayConfig::load_from_file(&config_path)
        .await
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    init_logging("gateway", &config.observability.logging)?;
    info!("Starting Thrift Gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let server = GatewayServer::from_config(&config).context("Failed to build gateway")?;
    info!(
        schema_dir = %config.schema.directory.display(),
        eager_resolve = config.client.eager_resolve,
        call_timeout_ms = config.client.call_timeout.as_millis() as u64,
        "Gateway components initialized"
    );

    let shutdown = CancellationToken::new();
    let server_shutdown = shutdown.clone();
    let mut server_handle = tokio::spawn(async move { server.start(server_shutdown).await });

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received, beginning graceful shutdown...");
            shutdown.cancel();
            match (&mut server_handle).await {
                Ok(Ok(())) => info!("Server shutdown completed gracefully"),
                Ok(Err(e)) => error!("Server error during shutdown: {}", e),
                Err(e) => error!("Server task failed: {}", e),
            }
        }
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => info!("Server task completed"),
                Ok(Err(e)) => {
                    error!("Server error: {}", e);
                    return Err(e.into());
                }
                Err(e) => return Err(anyhow::anyhow!("Server task failed: {}", e)),
            }
        }
    }

    info!("Thrift Gateway shutdown complete");
    Ok(())
}
