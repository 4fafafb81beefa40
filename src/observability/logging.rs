//! # Structured Logging
//!
//! Installs the global `tracing` subscriber for both binaries.
//!
//! `RUST_LOG` wins when set; otherwise the configured level is used as the filter directive.
//! Output is JSON (one object per event, with span context) or human-readable text.

use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::core::config::{LogConfig, LogFormat};
use crate::core::error::{GatewayError, GatewayResult};

/// Build the event filter for `config`
pub fn build_filter(config: &LogConfig) -> GatewayResult<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level).map_err(|e| {
        GatewayError::config(format!("Invalid log level '{}': {}", config.level, e))
    })
}

/// Initialize the tracing subscriber.
///
/// Calling this more than once (tests, embedded use) keeps the first subscriber.
pub fn init_logging(service_name: &str, config: &LogConfig) -> GatewayResult<()> {
    let filter = build_filter(config)?;

    let initialized = match config.format {
        LogFormat::Json => Registry::default()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init(),
        LogFormat::Text => Registry::default()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init(),
    };

    if initialized.is_err() {
        warn!("Tracing subscriber already initialized, skipping initialization");
        return Ok(());
    }

    info!(
        service = %service_name,
        level = %config.level,
        format = ?config.format,
        "Structured logging initialized"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_level() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = LogConfig {
            level: "thrift_gateway=notalevel".to_string(),
            format: LogFormat::Text,
        };
        assert!(build_filter(&config).is_err());
    }

    #[test]
    fn test_double_initialization_is_tolerated() {
        let config = LogConfig::default();
        assert!(init_logging("test", &config).is_ok());
        assert!(init_logging("test", &config).is_ok());
    }
}
