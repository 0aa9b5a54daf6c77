//! Mini-P2P: the peer-to-peer wire protocol of a mini-blockchain node
//!
//! This crate provides:
//! - A 36-byte checksummed frame header with chain id and version checks
//! - HELLO/OK handshakes establishing sessions between peers
//! - Route table synchronization by XOR distance for peer discovery
//! - Broadcast of new blocks to every known peer
//! - A dispatcher handing received blocks to subscribers
//!
//! # Example
//!
//! ```no_run
//! use mini_p2p::core::Block;
//! use mini_p2p::network::{Node, NodeConfig, Subscriber};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = NodeConfig {
//!     bootstrap_peers: vec!["127.0.0.1:8680".parse()?],
//!     port: 8681,
//!     ..Default::default()
//! };
//! let node = Node::new(config);
//!
//! let (subscriber, mut blocks) = Subscriber::new(&["newblock"], 64);
//! node.register(&[subscriber]).await;
//! node.launch().await?;
//!
//! node.broadcast_block(Block::new(1, String::new(), "hello".into())).await?;
//! while let Some(msg) = blocks.recv().await {
//!     println!("{} from {}", msg.name, msg.from);
//! }
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod crypto;
pub mod network;

// Re-export commonly used types
pub use core::Block;
pub use crypto::{NodeKey, PeerId};
pub use network::{
    ConnectionStatus, NetMessage, Node, NodeConfig, NodeStatus, PeerError, PeerInfo, Subscriber,
    TaggedMessage,
};
