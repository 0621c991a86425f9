//! Hub daemon
//!
//! Loads the hub configuration, builds the automation group and runs it until
//! interrupted.

mod hub;

use anyhow::{Context as _, Result};
use clap::Parser;
use hub::Hub;
use hub_config::HubConfig;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "hubd", version, about = "Home automation hub")]
struct Args {
    /// Configuration directory (also holds secrets.yaml)
    #[arg(short, long, default_value = ".")]
    config: PathBuf,

    /// Configuration file, relative to the configuration directory
    #[arg(short, long, default_value = "configuration.yaml")]
    file: PathBuf,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting hubd");

    let config = HubConfig::load(&args.config, &args.file).with_context(|| {
        format!(
            "loading {} from {}",
            args.file.display(),
            args.config.display()
        )
    })?;

    let hub = Hub::from_config(&config).await?;
    let bus_log = hub.spawn_bus_logger();

    hub.start().await?;
    info!(name = %config.name, "Hub is running");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("Shutting down");

    hub.stop().await?;
    bus_log.abort();

    Ok(())
}
