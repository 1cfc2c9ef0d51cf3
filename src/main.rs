//! # Slate Gateway
//!
//! Ground-station gateway relaying telemetry from a remote unit to operator
//! consoles and operator commands back to the remote unit.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::{TcpListener, UdpSocket};
use tracing::info;

use slate_gateway::auth::{AuthGate, FileAuthStore};
use slate_gateway::config::Config;
use slate_gateway::gateway::{Gateway, GatewaySettings};
use slate_gateway::server;
use slate_gateway::telemetry::AuditLog;
use slate_gateway::uplink::TcpConnector;

/// Command line arguments
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config/default.toml")]
    config: PathBuf,
}

/// Main entry point for Slate Gateway
///
/// Loads the configuration, binds the datagram and console sockets, starts
/// the gateway and runs until Ctrl+C.
///
/// # Errors
///
/// Returns error if:
/// - The configuration cannot be loaded
/// - The audit log or token store cannot be opened
/// - A socket cannot be bound
///
/// # Examples
///
/// ```bash
/// RUST_LOG=slate_gateway=debug cargo run --release -- --config config/default.toml
/// ```
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Slate Gateway v{} starting...", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;

    let audit = if config.audit.enabled {
        AuditLog::open(&config.audit.log_dir, &config.audit.initial_log)
            .with_context(|| format!("opening audit log in {}", config.audit.log_dir))?
    } else {
        info!("Audit log disabled");
        AuditLog::disabled()
    };

    let store = FileAuthStore::open(&config.auth.token_file)
        .await
        .with_context(|| format!("opening token store {}", config.auth.token_file))?;
    let auth = AuthGate::new(Arc::new(store), config.auth.passphrase.clone());

    let socket = UdpSocket::bind(&config.ingest.bind_address)
        .await
        .with_context(|| format!("binding telemetry socket {}", config.ingest.bind_address))?;
    let listener = TcpListener::bind(&config.subscribers.bind_address)
        .await
        .with_context(|| format!("binding subscriber endpoint {}", config.subscribers.bind_address))?;

    let mut gateway = Gateway::start(
        GatewaySettings::from(&config),
        TcpConnector::new(config.uplink.address.clone()),
        socket,
        auth,
        audit,
    );
    gateway.spawn(
        "subscribers",
        server::serve(listener, gateway.context(), gateway.cancellation()),
    );

    info!("Press Ctrl+C to exit");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");

    gateway.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_path() {
        let args = Args::parse_from(["slate-gateway"]);
        assert_eq!(args.config, PathBuf::from("config/default.toml"));
    }

    #[test]
    fn test_config_flag() {
        let args = Args::parse_from(["slate-gateway", "--config", "/etc/slate.toml"]);
        assert_eq!(args.config, PathBuf::from("/etc/slate.toml"));
    }
}
