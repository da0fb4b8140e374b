//! # Wacast — WhatsApp scheduling dashboard core
//!
//! Two cooperating processes over one lock-guarded JSON document:
//!
//!   wacast gateway    # HTTP API (job CRUD, WA status, activity log)
//!   wacast worker     # polling scheduler + WhatsApp bridge driver

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use wacast_channels::BridgeFactory;
use wacast_core::config::WacastConfig;
use wacast_store::DurableStore;
use wacast_worker::WorkerRuntime;

#[derive(Parser)]
#[command(name = "wacast", version, about = "WhatsApp status & message-flow scheduler")]
struct Cli {
    /// Config file path (default: ~/.wacast/config.toml)
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the job-scheduling worker process
    Worker,
    /// Run the HTTP gateway process
    Gateway,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "wacast=debug,tower_http=debug"
    } else {
        "wacast=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => {
            let mut config = WacastConfig::load_from(path)?;
            config.apply_env();
            config
        }
        None => WacastConfig::load()?,
    };

    let store = DurableStore::new(&config);
    store.ensure_exists()?;
    tracing::info!("data directory: {}", store.data_dir().display());

    match cli.command {
        Command::Worker => {
            let factory = Arc::new(BridgeFactory::new(config.bridge.clone(), store.clone()));
            let runtime = WorkerRuntime::new(store, config.worker.clone(), factory);
            wacast_worker::run(runtime).await;
        }
        Command::Gateway => {
            wacast_gateway::serve(&config.gateway, store).await?;
        }
    }

    Ok(())
}
