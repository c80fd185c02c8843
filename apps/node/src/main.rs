//! Syndro node entry point.

mod app;
mod config;
mod progress;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Send and receive files over parallel TCP connections.
#[derive(Parser)]
#[command(name = "syndro-node")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file path (defaults to ~/.config/syndro/node.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept incoming transfers until interrupted
    Receive {
        /// Download directory
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Listen port
        #[arg(short, long)]
        port: Option<u16>,

        /// Ask before accepting each transfer
        #[arg(long)]
        manual: bool,
    },

    /// Send a file to a receiving node
    Send {
        /// File to send
        file: PathBuf,

        /// Receiver address (host:port)
        #[arg(long)]
        peer: SocketAddr,

        /// Receiver's data channel token (defaults to this node's token)
        #[arg(long)]
        token: Option<String>,

        /// Number of parallel connections
        #[arg(short = 'n', long)]
        connections: Option<u32>,

        /// Chunk size in bytes
        #[arg(long)]
        chunk_size: Option<u32>,
    },
}

fn main() -> anyhow::Result<()> {
    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting Syndro node");

    let config = config::Config::load(cli.config.as_deref())?;
    tracing::info!(name = %config.name, device_id = %config.device_id, "configuration loaded");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match cli.command {
            Commands::Receive { dir, port, manual } => {
                app::receive(config, app::ReceiveOptions { dir, port, manual }).await
            }
            Commands::Send {
                file,
                peer,
                token,
                connections,
                chunk_size,
            } => {
                app::send(
                    config,
                    app::SendOptions {
                        file,
                        peer,
                        token,
                        connections,
                        chunk_size,
                    },
                )
                .await
            }
        }
    })
}
