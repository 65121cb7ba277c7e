//! Camera task hub service
//!
//! Serves the WebSocket protocol for frontends and camera clients and
//! bridges capture streams to processing devices over gRPC.
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{env}.toml)
//! 2. Environment variables (prefixed with HUB_)
//!
//! See `config.rs` for detailed configuration options.

use anyhow::Context;
use camhub::config::{HubConfig, LoggingConfig};
use camhub::device::GrpcConnector;
use camhub::hub::Hub;
use camhub::server;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = "camhub",
        version = env!("CARGO_PKG_VERSION"),
        bind_address = %config.server.bind_address,
        capture_program = %config.capture.program,
        "Starting camera hub"
    );

    config.validate().context("Invalid configuration")?;

    let connector = Arc::new(GrpcConnector::new(config.grpc.clone()));
    let hub = Arc::new(Hub::new(config, connector));

    let result = server::start_server(hub.clone(), shutdown_signal()).await;

    // Tasks and capture processes outlive the listener
    hub.shutdown().await;

    match result {
        Ok(()) => {
            info!("Shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Camera hub failed");
            Err(e)
        }
    }
}

/// Load configuration, falling back to environment variables only.
fn load_config() -> anyhow::Result<HubConfig> {
    let config = HubConfig::load().or_else(|e| {
        warn!(error = %e, "Failed to load config from files, trying environment");
        HubConfig::from_env()
    })?;

    Ok(config)
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = parse_level(&config.level);

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("camhub={}", level).parse()?)
        .add_directive("tonic=info".parse()?)
        .add_directive("tower_http=info".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("warn"), Level::WARN);
        assert_eq!(parse_level("verbose"), Level::INFO);
    }
}
