//! Nodelink CLI - attaches to (or starts) a node and follows its progress.
//!
//! Prints client events as they arrive and performs an orderly shutdown on
//! Ctrl-C: filters are removed, the socket closed and a spawned node stopped.

use anyhow::{Context, Result};
use clap::Parser;
use nodelink::{
    ClientSettings, LocalSocketTransport, NodeClient, NodeEvent, TcpTransport, TracingLogSink,
    Transport,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "nodelink")]
#[command(about = "Connect to a blockchain node over JSON-RPC IPC")]
struct Args {
    /// Settings file (JSON); created on first interval change
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the node binary
    #[arg(long)]
    node_path: Option<PathBuf>,

    /// Node data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Use the test network
    #[arg(long)]
    testnet: bool,

    /// IPC endpoint (defaults to the one inside the data directory)
    #[arg(long)]
    ipc_path: Option<PathBuf>,

    /// Connect over TCP to host:port instead of the IPC endpoint
    #[arg(long, conflicts_with = "ipc_path")]
    tcp: Option<String>,

    /// Poll interval in milliseconds
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Watch logs from these contract addresses
    #[arg(long = "watch", value_name = "ADDRESS")]
    watch: Vec<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn load_settings(args: &Args) -> Result<ClientSettings> {
    let mut settings = match &args.config {
        Some(path) => ClientSettings::load_or_default(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => ClientSettings::default(),
    };
    if let Some(node_path) = &args.node_path {
        settings.node_path = node_path.clone();
    }
    if let Some(data_dir) = &args.data_dir {
        settings.data_dir = data_dir.clone();
    }
    if args.testnet {
        settings.testnet = true;
    }
    if let Some(ipc_path) = &args.ipc_path {
        settings.ipc_path = Some(ipc_path.clone());
    }
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let settings = load_settings(&args)?;
    info!("Node binary: {}", settings.node_path.display());
    info!("Data directory: {}", settings.data_dir.display());

    let transport: Box<dyn Transport> = match &args.tcp {
        Some(addr) => Box::new(TcpTransport::tcp(addr.clone())),
        None => Box::new(LocalSocketTransport::local(settings.ipc_path())),
    };
    info!("Node endpoint: {}", transport.describe());

    let mut persisted = settings.clone();
    let (client, mut events) = NodeClient::spawn(settings, transport, Arc::new(TracingLogSink));
    if let Some(interval_ms) = args.poll_interval {
        client.set_poll_interval(interval_ms)?;
    }
    client.start()?;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    NodeEvent::ConnectionEstablished => {
                        info!("Connection established");
                        client.get_accounts()?;
                        if !args.watch.is_empty() {
                            client.register_event_filters(args.watch.clone(), Vec::new())?;
                        }
                    }
                    NodeEvent::AccountsListed(accounts) => {
                        info!("{} accounts", accounts.len());
                        for (index, account) in accounts.iter().enumerate() {
                            client.refresh_account(account.hash.clone(), index)?;
                        }
                    }
                    NodeEvent::AccountUpdated { index, account } => {
                        info!(
                            "Account {} {}: balance {} ether, {} transactions",
                            index,
                            account.hash,
                            account.balance.as_deref().unwrap_or("?"),
                            account
                                .transaction_count
                                .map(|n| n.to_string())
                                .unwrap_or_else(|| "?".to_string())
                        );
                    }
                    NodeEvent::SyncingChanged(status) if status.syncing => {
                        info!(
                            "Syncing: block {} of {}",
                            status.current_block, status.highest_block
                        );
                    }
                    NodeEvent::NewBlock(block) => {
                        info!(
                            "New block {}",
                            block.get("number").and_then(|n| n.as_str()).unwrap_or("?")
                        );
                    }
                    NodeEvent::NewLogEvent { log, .. } => {
                        info!("Log event: {}", serde_json::to_string(&log)?);
                    }
                    NodeEvent::ErrorRaised { message, code } => {
                        error!("Node error ({}): {}", code, message);
                    }
                    NodeEvent::PollIntervalChanged(interval) => {
                        persisted.set_poll_interval(interval);
                        if let Some(path) = &args.config {
                            if let Err(e) = persisted.save(path) {
                                warn!("Could not save settings: {}", e);
                            }
                        }
                    }
                    other => tracing::debug!("{:?}", other),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, closing");
                break;
            }
        }
    }

    client.shutdown().await?;
    info!("Node client closed");
    Ok(())
}
