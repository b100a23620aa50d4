//! codecollab-relay: WebSocket server for the shared room store.
//!
//! Clients read, write, append to and watch paths in one in-memory
//! key-value tree. Voice sessions use it for signal mailboxes, heartbeats
//! and mute flags. The relay never interprets the values it stores.

mod connection;
mod reaper;
mod server;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use codecollab_config::{load_config, load_from_path, validation, CodeCollabConfig};
use codecollab_common::ConfigError;
use codecollab_voice::MemoryStore;
use tokio::net::TcpListener;

use crate::reaper::run_reaper;
use crate::server::serve;

#[derive(Parser)]
#[command(name = "codecollab-relay", about = "Realtime store relay for CodeCollab rooms")]
struct Args {
    /// Port to listen on.
    #[arg(short, long, default_value_t = 8787)]
    port: u16,

    /// Config file to load instead of the platform default.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds without a heartbeat before a participant is reaped.
    /// Defaults to `heartbeat.stale_after_secs` from the config.
    #[arg(long)]
    stale_after: Option<u64>,

    /// Seconds between reaper sweeps.
    #[arg(long, default_value_t = 5)]
    reap_interval: u64,
}

fn load(args: &Args) -> Result<CodeCollabConfig, ConfigError> {
    match &args.config {
        Some(path) => {
            let config = load_from_path(path)?;
            validation::validate(&config)?;
            Ok(config)
        }
        None => load_config(),
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let (config, config_error) = match load(&args) {
        Ok(config) => (config, None),
        Err(e) => (CodeCollabConfig::default(), Some(e)),
    };

    let level = config.logging.level.as_filter();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("codecollab_relay={level},codecollab_voice={level}").into()
            }),
        )
        .init();

    if let Some(e) = config_error {
        tracing::warn!(error = %e, "Config unusable, running with defaults");
    }

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind TCP listener");
            std::process::exit(1);
        }
    };

    tracing::info!("codecollab-relay listening on {}", addr);

    let store = MemoryStore::new();
    let stale_after = args
        .stale_after
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.heartbeat.stale_after());
    tokio::spawn(run_reaper(
        store.clone(),
        Duration::from_secs(args.reap_interval),
        stale_after,
    ));

    serve(listener, store).await;
}
