//! P2P Networking module
//!
//! Provides the peer-to-peer wire protocol of a blockchain node.
//!
//! # Features
//! - Checksummed binary framing with chain id and version checks
//! - HELLO/OK/BYE handshake establishing peer sessions
//! - Kademlia-style route sync (SYNCROUTE/SYNCROUTEREPLY) for discovery
//! - NEWBLOCK broadcast to every known peer
//! - Subscriber dispatch of received blocks

mod broadcast;
mod discovery;
mod handler;
mod handshake;

pub mod dispatcher;
pub mod frame;
pub mod message;
pub mod node;
pub mod peer;
pub mod peerstore;
pub mod route_table;
pub mod server;

pub use dispatcher::{Dispatcher, Subscriber};
pub use frame::{build_frame, parse_frame, Frame, FrameCodec, FrameError, HEADER_LEN};
pub use message::{
    MessageKind, NetMessage, PeerInfo, TaggedMessage, MAGIC, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
pub use node::{ConfigError, Node, NodeConfig, NodeStatus};
pub use peer::{ConnectionStatus, PeerError, PeerHandle, Session, SessionStore};
pub use peerstore::{Peerstore, PERMANENT_ADDR_TTL, TEMP_ADDR_TTL};
pub use route_table::RouteTable;
pub use server::{connect_to_peer, Connection, Identity, Server, IDENTITY_LEN};
