//! Network message types for P2P communication
//!
//! Defines the protocol constants, the message names carried in frame
//! headers and the payload types exchanged between peers.

use crate::core::Block;
use crate::crypto::PeerId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Protocol version byte written in every frame header
pub const PROTOCOL_VERSION: u8 = 1;

/// Magic bytes identifying frames of this protocol
pub const MAGIC: [u8; 4] = [0x4E, 0x45, 0x42, 0x31]; // "NEB1"

/// Maximum payload size accepted from a peer (8 MiB)
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Message names as they appear on the wire
pub const HELLO: &str = "hello";
pub const OK: &str = "ok";
pub const BYE: &str = "bye";
pub const SYNCROUTE: &str = "syncroute";
pub const NEWBLOCK: &str = "newblock";
pub const SYNCROUTEREPLY: &str = "resyncroute";

/// Messages understood by the stream handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Hello,
    Ok,
    Bye,
    SyncRoute,
    NewBlock,
    SyncRouteReply,
}

impl MessageKind {
    /// Wire name of this message
    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::Hello => HELLO,
            MessageKind::Ok => OK,
            MessageKind::Bye => BYE,
            MessageKind::SyncRoute => SYNCROUTE,
            MessageKind::NewBlock => NEWBLOCK,
            MessageKind::SyncRouteReply => SYNCROUTEREPLY,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            HELLO => Some(MessageKind::Hello),
            OK => Some(MessageKind::Ok),
            BYE => Some(MessageKind::Bye),
            SYNCROUTE => Some(MessageKind::SyncRoute),
            NEWBLOCK => Some(MessageKind::NewBlock),
            SYNCROUTEREPLY => Some(MessageKind::SyncRouteReply),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A peer and the addresses it can be dialed on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addrs: Vec<SocketAddr>,
}

impl PeerInfo {
    pub fn new(id: PeerId, addrs: Vec<SocketAddr>) -> Self {
        Self { id, addrs }
    }

    /// Serialize a peer list for a SYNCROUTEREPLY payload
    pub fn encode_list(peers: &[PeerInfo]) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(peers)
    }

    /// Deserialize a SYNCROUTEREPLY payload
    pub fn decode_list(data: &[u8]) -> Result<Vec<PeerInfo>, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// Application messages that can be broadcast to, or received from, peers
#[derive(Debug, Clone, PartialEq)]
pub enum NetMessage {
    /// Announce a newly produced block
    NewBlock(Block),
}

impl NetMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            NetMessage::NewBlock(_) => MessageKind::NewBlock,
        }
    }

    /// Serialize to the frame payload
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            NetMessage::NewBlock(block) => block.to_bytes(),
        }
    }
}

/// A decoded message tagged with its wire name, as handed to subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedMessage {
    pub name: &'static str,
    pub from: PeerId,
    pub message: NetMessage,
}

impl TaggedMessage {
    pub fn new(from: PeerId, message: NetMessage) -> Self {
        Self {
            name: message.kind().name(),
            from,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_names_fit_header() {
        for kind in [
            MessageKind::Hello,
            MessageKind::Ok,
            MessageKind::Bye,
            MessageKind::SyncRoute,
            MessageKind::NewBlock,
            MessageKind::SyncRouteReply,
        ] {
            assert!(kind.name().len() <= 11);
            assert_eq!(MessageKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(MessageKind::from_name("ping"), None);
    }

    #[test]
    fn test_peer_list_serialization() {
        let peers = vec![
            PeerInfo::new(PeerId::random(), vec!["127.0.0.1:9000".parse().unwrap()]),
            PeerInfo::new(PeerId::random(), vec![]),
        ];
        let bytes = PeerInfo::encode_list(&peers).unwrap();
        assert_eq!(PeerInfo::decode_list(&bytes).unwrap(), peers);
    }

    #[test]
    fn test_tagged_message_name() {
        let block = Block::new(1, String::new(), "data".to_string());
        let tagged = TaggedMessage::new(PeerId::random(), NetMessage::NewBlock(block));
        assert_eq!(tagged.name, NEWBLOCK);
    }
}
