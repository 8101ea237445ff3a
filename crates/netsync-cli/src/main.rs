//! netsync: interactive console for a LAN sync node.
//!
//! Starts a node that discovers peers over UDP broadcast and replicates
//! a key-value store over TCP, then drives it with line commands.

mod console;

use anyhow::Result;
use clap::Parser;
use console::Console;
use netsync_core::{Coordinator, NetSyncConfig, TypeRegistry, DEFAULT_DISCOVERY_PORT};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "netsync")]
#[command(about = "Serverless LAN key-value sync node")]
struct Args {
    /// UDP discovery port shared by every node on the network
    #[arg(short, long, default_value_t = DEFAULT_DISCOVERY_PORT)]
    port: u16,

    /// Announce address (defaults to limited broadcast on the discovery port)
    #[arg(long)]
    announce: Option<SocketAddr>,

    /// Don't join the network at boot; drive it with start/stop commands
    #[arg(long)]
    manual: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

/// The value type the console stores under every key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleMessage {
    pub message: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,netsync_core=debug"
    } else {
        "info,netsync_core=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting netsync");
    info!("Discovery port: {}", args.port);

    let mut config = NetSyncConfig::with_port(args.port);
    if let Some(announce) = args.announce {
        config.announce_addr = announce;
    }
    config.manual_start = args.manual;

    // Closed world: every node must register the same value types
    let mut registry = TypeRegistry::new();
    registry.register::<ConsoleMessage>("console.message");

    let coordinator = Arc::new(Coordinator::new(config.clone(), Arc::new(registry)));

    if config.manual_start {
        info!("Manual mode: type 'start' to join the network");
    } else {
        coordinator.start().await?;
    }

    Console::new(coordinator.clone()).run().await?;

    coordinator.stop().await;
    info!("Bye");
    Ok(())
}
