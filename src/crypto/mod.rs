//! Cryptographic utilities for the p2p layer
//!
//! This module provides:
//! - SHA-256 hashing
//! - Node key management (secp256k1) and peer identities

pub mod hash;
pub mod keys;

pub use hash::{sha256, sha256_hex};
pub use keys::{KeyError, NodeKey, PeerId, PEER_ID_LEN};
