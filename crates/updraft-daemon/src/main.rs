//! updraft-daemon - peer-to-peer signed update distribution.
//!
//! Two modes share the binary:
//!
//! - `agent`: joins the overlay, ingests signed update notifications,
//!   fetches payloads, and serves the local administration API.
//! - `server`: runs the rendezvous server - the UDP binding endpoint,
//!   the TCP notification catalog, and the snapshot loop.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use updraft_core::config::{AgentConfig, ServerConfig};
use updraft_daemon::agent::Agent;
use updraft_daemon::rendezvous::RendezvousServer;

/// updraft daemon - epidemic distribution of signed updates
#[derive(Parser, Debug)]
#[command(name = "updraft-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "updraft.json")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the agent
    Agent {
        /// Rendezvous server address (overrides the config file)
        #[arg(long)]
        server: Option<String>,

        /// Local overlay bind address (overrides the config file)
        #[arg(long)]
        address: Option<String>,

        /// Data directory (overrides the config file)
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// API socket path (overrides the config file)
        #[arg(long)]
        socket: Option<PathBuf>,
    },

    /// Run the rendezvous server
    Server {
        /// Listen address for UDP and TCP (overrides the config file)
        #[arg(long)]
        address: Option<String>,
    },
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

/// Blocks until SIGINT or SIGTERM.
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;

    match &args.command {
        Command::Agent {
            server,
            address,
            data_dir,
            socket,
        } => {
            let mut config = if args.config.exists() {
                AgentConfig::from_file(&args.config).context("failed to load configuration")?
            } else {
                info!(path = %args.config.display(), "no config file, using defaults");
                AgentConfig::default()
            };
            if let Some(server) = server {
                config.overlay.server.clone_from(server);
            }
            if let Some(address) = address {
                config.overlay.address.clone_from(address);
            }
            if let Some(data_dir) = data_dir {
                config.data_dir.clone_from(data_dir);
            }
            if let Some(socket) = socket {
                config.api.socket.clone_from(socket);
            }

            let agent = Agent::start(config).await.context("failed to start agent")?;
            wait_for_signal().await;
            agent.shutdown().await;
        },
        Command::Server { address } => {
            let mut config = if args.config.exists() {
                ServerConfig::from_file(&args.config).context("failed to load configuration")?
            } else {
                info!(path = %args.config.display(), "no config file, using defaults");
                ServerConfig::default()
            };
            if let Some(address) = address {
                config.address.clone_from(address);
            }

            let server = RendezvousServer::bind(config)
                .await
                .context("failed to start rendezvous server")?;
            wait_for_signal().await;
            server.shutdown().await;
        },
    }

    info!("daemon exited");
    Ok(())
}
