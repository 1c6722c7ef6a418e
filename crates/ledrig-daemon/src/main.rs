//! LED Rig Relay Daemon
//!
//! Owns the serial-attached rig and relays commands from HTTP and WebSocket
//! clients to it.

mod config;
mod relay;

use anyhow::{Context, Result};
use ledrig_hw::SerialTransport;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use relay::Relay;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/default.toml".to_string());

    let config = Config::load(&config_path).context("Failed to load configuration")?;
    info!("Loaded configuration from: {}", config_path);

    // The gate opens the port itself and keeps retrying if the rig is absent
    let transport = Arc::new(SerialTransport::new(
        &config.serial.port,
        config.serial.baud,
        config.serial_timeout(),
    ));
    let relay = Relay::spawn(transport, config.relay_settings());
    info!(
        "Relaying to {} at {} baud",
        config.serial.port, config.serial.baud
    );

    // Setup Unix signal handlers
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    let addr: SocketAddr = config
        .relay
        .listen
        .parse()
        .context("Invalid listen address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Relay listening on http://{}", addr);

    let app = relay.router();

    // Run server with shutdown handling
    tokio::select! {
        result = axum::serve(listener, app) => {
            result?;
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down");
        }
    }

    relay.shutdown().await;
    Ok(())
}
