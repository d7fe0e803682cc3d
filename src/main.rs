//! Cluster-Cache CLI Application
//!
//! Starts a cache node and keeps it in the cluster until Ctrl+C.

use clap::{Parser, Subcommand};
use cluster_cache::network::{
    IdGenerator, Node, NodeConfig, RandomIdGenerator, DEFAULT_PORT, NODE_ID_LENGTH,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "cluster-cache")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Clustered in-memory cache node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node
    Start {
        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Node identity (generated when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Existing member to join (host:port)
        #[arg(short, long)]
        join: Option<String>,

        /// Listen on every interface
        #[arg(long)]
        bind_all: bool,

        /// Local address to listen on (repeatable)
        #[arg(long = "local-address")]
        local_addresses: Vec<String>,
    },

    /// Print a fresh node identity
    GenId {
        /// Seed for a reproducible identity
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Write a configuration file with default settings
    InitConfig {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            config,
            id,
            port,
            join,
            bind_all,
            local_addresses,
        } => {
            let mut node_config = match config {
                Some(path) => NodeConfig::load(&path)?,
                None => NodeConfig::default(),
            };

            if let Some(id) = id {
                node_config.id = id;
            }
            if let Some(port) = port {
                node_config.local_port = port;
            }
            if let Some(address) = join {
                node_config.join = true;
                node_config.join_address = address;
            }
            if bind_all {
                node_config.bind_all = true;
            }
            if !local_addresses.is_empty() {
                node_config.local_addresses = local_addresses;
            }

            run_node(node_config)?;
        }

        Commands::GenId { seed } => {
            let generator = match seed {
                Some(seed) => RandomIdGenerator::seeded(seed),
                None => RandomIdGenerator::new(),
            };
            println!("{}", generator.generate(NODE_ID_LENGTH));
        }

        Commands::InitConfig { output } => {
            NodeConfig::default().save(&output)?;
            println!("Wrote default configuration to {:?}", output);
            println!("   Nodes listen on port {} unless changed", DEFAULT_PORT);
        }
    }

    Ok(())
}

fn run_node(config: NodeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(serve(config))
}

async fn serve(config: NodeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut node = Node::new(config);
    let mut fatal = node
        .take_fatal_events()
        .ok_or("fatal event receiver already taken")?;

    node.start().await?;
    println!("Node {} listening on {:?}", node.id(), node.listen_addrs());

    let failure = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!("\nShutting down node...");
            None
        }
        Some(event) = fatal.recv() => {
            log::error!("CRITICAL: {}", event);
            Some(event)
        }
    };

    node.shutdown().await;

    match failure {
        Some(event) => Err(event.to_string().into()),
        None => Ok(()),
    }
}
