use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use log::{error, info};
use tokio_util::sync::CancellationToken;

mod backend;
mod config;
mod device;
mod learning;
mod messages;
mod monitor;
mod neighbor;
mod notify;
mod occupancy;
mod probe;
mod schedule;

/// Track whether a property is occupied by watching for known devices on
/// the local network.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Display diagnostic output (overridden by RUST_LOG)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut logger = pretty_env_logger::formatted_timed_builder();
    logger.filter_level(if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    });
    if let Ok(filters) = std::env::var("RUST_LOG") {
        logger.parse_filters(&filters);
    }
    logger.init();

    let config = config::AppConfig::load(&args.config)?;
    let settings = config.validate().context("invalid configuration")?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Interrupted, shutting down");
                    cancel.cancel();
                }
                Err(err) => error!("Unable to listen for shutdown signal: {err}"),
            }
        }
    });

    let backend = Arc::new(backend::SystemBackend::detect().await);
    let core = monitor::Monitor::new(settings, backend, Box::new(device::SystemResolver), cancel);
    core.run_loop().await?;

    Ok(())
}
