//! Peer Overlay CLI Application
//!
//! Maintains the peer directory and runs local overlay simulations.

use clap::{Parser, Subcommand};
use peer_overlay::cli;
use peer_overlay::directory::REALLY_DEAD_NUM_FAILURES_CUTOFF;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "overlay")]
#[command(version = "0.1.0")]
#[command(about = "Peer-to-peer overlay over a shared message broker", long_about = None)]
struct Cli {
    /// Data directory for the peer table
    #[arg(short, long, default_value = ".overlay_data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print random identities
    Identity {
        /// How many to print
        #[arg(short, long, default_value = "1")]
        count: usize,

        /// Print app+peer identities instead of peer identities
        #[arg(short, long)]
        full: bool,
    },

    /// Peer directory operations
    Peers {
        #[command(subcommand)]
        action: PeerCommands,
    },

    /// Run several overlays over an in-process broker
    Simulate {
        /// Number of overlays
        #[arg(short, long, default_value = "4")]
        nodes: usize,

        /// Messages broadcast by node 0
        #[arg(short, long, default_value = "10")]
        messages: usize,
    },
}

#[derive(Subcommand)]
enum PeerCommands {
    /// List all known peers
    List,

    /// Add a peer, optionally as an outbound or preferred candidate
    Add {
        /// Peer identity (8 characters)
        peer: String,

        #[arg(short, long)]
        preferred: bool,

        #[arg(short, long)]
        outbound: bool,
    },

    /// Delete peers with at least this many failures
    Prune {
        #[arg(short, long, default_value_t = REALLY_DEAD_NUM_FAILURES_CUTOFF)]
        min_failures: u32,

        /// Only consider this peer
        #[arg(short, long)]
        peer: Option<String>,
    },

    /// Show a random fanout and the currently dialable peers
    Sample {
        #[arg(short, long, default_value = "8")]
        size: usize,

        /// Identity left out of the sample
        #[arg(short, long, default_value = "00000000")]
        exclude: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Identity { count, full } => cli::cmd_identity(count, full),

        Commands::Peers { action } => {
            let directory = cli::open_directory(&cli.data_dir)?;
            match action {
                PeerCommands::List => cli::cmd_peers_list(&directory),
                PeerCommands::Add {
                    peer,
                    preferred,
                    outbound,
                } => cli::cmd_peers_add(&directory, &peer, preferred, outbound),
                PeerCommands::Prune { min_failures, peer } => {
                    cli::cmd_peers_prune(&directory, min_failures, peer.as_deref())
                }
                PeerCommands::Sample { size, exclude } => {
                    cli::cmd_peers_sample(&directory, size, &exclude)
                }
            }
        }

        Commands::Simulate { nodes, messages } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cli::cmd_simulate(nodes, messages))
        }
    }
}
