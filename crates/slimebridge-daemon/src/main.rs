//! SlimeBridge Daemon - Main entry point
//!
//! Registers the configured virtual trackers, optionally drives them from
//! the synthetic pose source, and runs until interrupted.

mod config;
mod state;
mod synthetic;

use anyhow::Result;
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "slimebridge")]
#[command(about = "Virtual IMU tracker emulator for body-tracking hosts")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "slimebridge.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Send discovery handshakes to this address instead of broadcasting
    #[arg(long)]
    host: Option<IpAddr>,

    /// Write an example configuration to --config and exit
    #[arg(long)]
    write_default_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("SlimeBridge v{}", env!("CARGO_PKG_VERSION"));

    if args.write_default_config {
        config::save_default_config(&args.config)?;
        info!(path = %args.config.display(), "Wrote default configuration");
        return Ok(());
    }

    // Load configuration
    let mut config = config::load_config(&args.config)?;

    if let Some(host) = args.host {
        config.host.discovery_addr = host;
    }

    info!(
        discovery = %config.host.discovery_addr,
        port = config.host.port,
        devices = config.devices.len(),
        synthetic = config.synthetic.enabled,
        "Configuration loaded"
    );

    let state = state::AppState::new(config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if state.config.synthetic.enabled {
        state.adopt(synthetic::spawn(state.clone(), shutdown_rx));
    }

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");

    shutdown_tx.send_replace(true);
    state.shutdown().await;

    Ok(())
}
