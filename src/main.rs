//! Mini-P2P CLI Application
//!
//! Runs a P2P node of the mini-blockchain network.

use clap::{Parser, Subcommand};
use mini_p2p::crypto::NodeKey;
use mini_p2p::network::message::NEWBLOCK;
use mini_p2p::network::{Node, NodeConfig, Subscriber};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mini-p2p")]
#[command(version = "0.1.0")]
#[command(about = "P2P wire protocol node for a mini-blockchain", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// P2P Node operations
    Node {
        #[command(subcommand)]
        action: NodeCommands,
    },
}

#[derive(Subcommand)]
enum NodeCommands {
    /// Start the P2P node
    Start {
        /// JSON config file; command line flags override its values
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Interface to listen on
        #[arg(long)]
        host: Option<IpAddr>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Chain id; peers on other chains are rejected
        #[arg(long)]
        chain_id: Option<u32>,

        /// Protocol version byte
        #[arg(long)]
        protocol_version: Option<u8>,

        /// Initial peers to connect to (comma-separated)
        #[arg(long, value_delimiter = ',')]
        peers: Vec<SocketAddr>,

        /// Maximum peers returned for one route sync request
        #[arg(long)]
        max_sync_nodes: Option<usize>,

        /// Node private key (hex); a new one is generated if omitted
        #[arg(short, long)]
        key: Option<String>,
    },

    /// Print the peer id of a key, generating a new key if none is given
    Id {
        /// Node private key (hex)
        #[arg(short, long)]
        key: Option<String>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Node { action } => run_node_command(action),
    }
}

fn load_key(key: Option<&str>) -> Result<NodeKey, Box<dyn std::error::Error>> {
    match key {
        Some(hex) => Ok(NodeKey::from_private_key_hex(hex)?),
        None => Ok(NodeKey::generate()),
    }
}

fn run_node_command(action: NodeCommands) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        NodeCommands::Id { key } => {
            let node_key = load_key(key.as_deref())?;
            if key.is_none() {
                println!("Private key: {}", node_key.private_key_hex());
            }
            println!("Peer id:     {}", node_key.peer_id());
            Ok(())
        }

        NodeCommands::Start {
            config,
            host,
            port,
            chain_id,
            protocol_version,
            peers,
            max_sync_nodes,
            key,
        } => {
            let mut node_config = match config {
                Some(path) => NodeConfig::from_file(path)?,
                None => NodeConfig::default(),
            };
            if let Some(host) = host {
                node_config.host = host;
            }
            if let Some(port) = port {
                node_config.port = port;
            }
            if let Some(chain_id) = chain_id {
                node_config.chain_id = chain_id;
            }
            if let Some(version) = protocol_version {
                node_config.version = version;
            }
            if let Some(max) = max_sync_nodes {
                node_config.max_sync_nodes = max;
            }
            node_config.bootstrap_peers.extend(peers);

            let node_key = load_key(key.as_deref())?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_node(node_config, node_key))
        }
    }
}

async fn run_node(config: NodeConfig, key: NodeKey) -> Result<(), Box<dyn std::error::Error>> {
    println!(
        "Starting P2P node on {} (chain {})...",
        config.listen_addr(),
        config.chain_id
    );
    let node = Node::with_key(config, &key);

    let (subscriber, mut blocks) = Subscriber::new(&[NEWBLOCK], 64);
    node.register(&[subscriber]).await;
    tokio::spawn(async move {
        while let Some(msg) = blocks.recv().await {
            println!("Received {} from {}", msg.name, msg.from);
        }
    });

    node.launch().await?;
    let status = node.status().await;
    println!("Peer id: {}", status.peer_id);
    println!("Listening on {}", status.listen_addr);
    println!(
        "Route table: {} peers, {} connected",
        status.route_table_size, status.connected_peers
    );

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down node...");
    node.stop().await;
    Ok(())
}
