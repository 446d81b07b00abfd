//! meshfs Daemon (`meshfsd`)
//!
//! Runs one meshfs node until interrupted.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use meshfs::{Node, NodeConfig};

#[derive(Parser, Debug)]
#[command(name = "meshfsd", version, about = "meshfs peer-to-peer sync daemon")]
struct Args {
    /// TOML configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Peer listen address (overrides the config file)
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Local control listen address (overrides the config file)
    #[arg(long)]
    control: Option<SocketAddr>,

    /// Data directory (overrides the config file)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Display name announced to peers
    #[arg(long)]
    name: Option<String>,

    /// Peers to dial at startup (host:port)
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Verbose logging (-v for debug, -vv for trace)
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn into_config(self) -> anyhow::Result<(NodeConfig, Vec<String>)> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => NodeConfig::default(),
        };
        if let Some(addr) = self.listen {
            config.listen_addr = addr;
        }
        if let Some(addr) = self.control {
            config.control_addr = Some(addr);
        }
        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
        if let Some(name) = self.name {
            config.display_name = name;
        }
        config.validate()?;
        Ok((config, self.peers))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    tracing::info!("meshfsd v{} starting...", env!("CARGO_PKG_VERSION"));
    let (config, peers) = args.into_config()?;

    let node = Node::spawn(config).await.map_err(|e| {
        tracing::error!("Failed to start: {}", e);
        anyhow::anyhow!("{}", e)
    })?;
    tracing::info!("Node: {} ({})", node.display_name(), node.fingerprint());

    for peer in &peers {
        if let Err(e) = node.connect_to(peer).await {
            tracing::warn!(peer = %peer, "initial connection failed: {}", e);
        }
    }

    tracing::info!("Daemon ready. Press Ctrl+C to stop.");
    shutdown_signal().await;
    tracing::info!("Shutdown signal received...");

    node.shutdown().await;
    tracing::info!("Daemon stopped");
    Ok(())
}

fn init_tracing(verbosity: u8) {
    let mut filter = EnvFilter::from_default_env();

    // Only apply defaults if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        let level = match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        if let Ok(directive) = level.parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
            }
            _ => {
                tracing::warn!("signal handlers unavailable, falling back to Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
        }
    }
}
