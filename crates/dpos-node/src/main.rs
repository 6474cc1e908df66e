//! DPoS relay node.
//!
//! Entry point for the dpos-node binary.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

mod config;
mod node;

use config::NodeConfig;
use node::Node;

/// DPoS relay node.
#[derive(Parser, Debug)]
#[command(name = "dpos-node")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "dpos-node.toml")]
    config: PathBuf,

    /// Data directory
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Network to connect to
    #[arg(short, long, default_value = "mainnet")]
    network: String,

    /// P2P port
    #[arg(long)]
    port: Option<u16>,

    /// Seed peer as ip:port (repeatable)
    #[arg(long = "seed")]
    seeds: Vec<String>,

    /// Don't discover peers at boot
    #[arg(long)]
    skip_discovery: bool,

    /// Never discover peers
    #[arg(long)]
    disable_discovery: bool,

    /// Start a new network from genesis
    #[arg(long)]
    network_start: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting DPoS relay node v{}", env!("CARGO_PKG_VERSION"));

    let config = NodeConfig::load(&args.config, &args)?;

    info!("Network: {}", config.network);
    info!("Data directory: {:?}", config.data_dir);
    info!("P2P port: {}", config.p2p.port);

    let node = Node::new(config)?;

    let node_handle = node.clone();
    let shutdown_signal = async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received");
        node_handle.shutdown();
    };
    tokio::spawn(shutdown_signal);

    if let Err(e) = node.run().await {
        tracing::error!("Node error: {}", e);
    }

    info!("DPoS node stopped");
    Ok(())
}
