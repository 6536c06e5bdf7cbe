//! updraft - operator CLI.
//!
//! Builds and submits signed update notifications and inspects a running
//! agent through its Unix-socket API.

mod client;
mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// updraft - peer-to-peer secure update tooling
#[derive(Parser, Debug)]
#[command(name = "updraft")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Agent socket path
    #[arg(short, long, global = true, default_value = "updraft.sock")]
    socket: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate an Ed25519 keypair for signing updates
    Keygen {
        /// Where to write the signing key; the verifying key lands next
        /// to it with a .pub extension
        #[arg(short, long, default_value = "updraft.key")]
        out: PathBuf,
    },

    /// Build, sign, and submit an update
    Submit {
        /// Update payload file
        #[arg(short, long)]
        file: PathBuf,

        /// Target resource uuid
        #[arg(short, long)]
        uuid: String,

        /// Update version; defaults to the current Unix time
        #[arg(short, long)]
        version: Option<u64>,

        /// Signing key path
        #[arg(short, long, default_value = "updraft.key")]
        key: PathBuf,

        /// Tracker endpoint recorded in the notification
        #[arg(short, long, default_value = "https://tracker.updraft.io:443/announce")]
        tracker: String,

        /// Piece length in bytes
        #[arg(short, long, default_value_t = updraft_core::notification::DEFAULT_PIECE_LENGTH)]
        piece_length: u64,

        /// Write the signed submission to a file ('-' for stdout)
        /// instead of posting it to the agent
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List known update uuids
    List,

    /// Show one update
    Get {
        /// Update uuid
        uuid: String,
    },

    /// Delete an update and its payload
    Delete {
        /// Update uuid
        uuid: String,
    },

    /// Force a one-off re-broadcast of an update
    Rebroadcast {
        /// Update uuid
        uuid: String,
    },

    /// Show the agent's current session table
    Peers,

    /// Show the agent's effective configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let agent = client::AgentClient::new(&cli.socket);

    match cli.command {
        Command::Keygen { out } => commands::keygen(&out),
        Command::Submit {
            file,
            uuid,
            version,
            key,
            tracker,
            piece_length,
            output,
        } => commands::submit(&agent, commands::SubmitArgs {
            file,
            uuid,
            version,
            key,
            tracker,
            piece_length,
            output,
        }),
        Command::List => commands::show(&agent, "/update"),
        Command::Get { uuid } => commands::show(&agent, &format!("/update/{uuid}")),
        Command::Delete { uuid } => commands::delete(&agent, &uuid),
        Command::Rebroadcast { uuid } => commands::rebroadcast(&agent, &uuid),
        Command::Peers => commands::show(&agent, "/overlay/peers"),
        Command::Config => commands::show(&agent, "/config"),
    }
}
