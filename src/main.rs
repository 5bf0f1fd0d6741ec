//! Peer switch daemon
//!
//! A command-line interface for running and inspecting a switch node.

use clap::{Parser, Subcommand};
use peer_switch::cli::{self, StartOptions};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "switchd")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Peer connection switch for a peer-to-peer network node", long_about = None)]
struct Cli {
    /// Data directory for keys, bans and the address book
    #[arg(short, long, default_value = ".switch_data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the node key, or show the existing one
    Keygen,

    /// Start the switch
    Start {
        /// Listen address, overrides the config file
        #[arg(short, long)]
        listen: Option<String>,

        /// Comma-separated peers to dial at startup
        #[arg(short, long)]
        peers: Option<String>,

        /// Maximum number of peers
        #[arg(long)]
        max_peers: Option<usize>,

        /// Human readable node name
        #[arg(long, default_value = "switchd")]
        moniker: String,

        /// Network name; peers on other networks are rejected
        #[arg(long, default_value = "mainnet")]
        network: String,
    },

    /// Banned host operations
    Bans {
        #[command(subcommand)]
        action: BanCommands,
    },
}

#[derive(Subcommand)]
enum BanCommands {
    /// List banned hosts
    List,

    /// Ban a host
    Add {
        /// Host (IP address) to ban
        host: String,

        /// Ban duration in seconds, defaults to the configured duration
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Lift a ban
    Remove {
        /// Host (IP address) to unban
        host: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen => cli::cmd_keygen(&cli.data_dir)?,

        Commands::Start {
            listen,
            peers,
            max_peers,
            moniker,
            network,
        } => {
            let peers: Vec<String> = peers
                .map(|p| p.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default();
            let options = StartOptions {
                listen,
                peers,
                max_peers,
                moniker,
                network,
            };

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cli::cmd_start(&cli.data_dir, options))?;
        }

        Commands::Bans { action } => match action {
            BanCommands::List => cli::cmd_bans_list(&cli.data_dir)?,
            BanCommands::Add { host, duration } => {
                cli::cmd_bans_add(&cli.data_dir, &host, duration)?
            }
            BanCommands::Remove { host } => cli::cmd_bans_remove(&cli.data_dir, &host)?,
        },
    }

    Ok(())
}
