//! Node keys and peer identities
//!
//! Every node owns a secp256k1 key pair. Its peer identity is the
//! SHA-256 digest of the compressed public key, rendered as base58.

use rand::rngs::OsRng;
use rand::RngCore;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::hash::sha256;

/// Length of a peer identity in bytes
pub const PEER_ID_LEN: usize = 32;

/// Errors that can occur during key operations
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid peer id: {0}")]
    InvalidPeerId(String),
}

/// Opaque fixed-length peer identity
///
/// Also the key space of the route table: distance between two ids is
/// their bytewise XOR read as a big-endian integer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    pub fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        let arr: [u8; PEER_ID_LEN] = bytes
            .try_into()
            .map_err(|_| KeyError::InvalidPeerId(format!("expected {} bytes", PEER_ID_LEN)))?;
        Ok(Self(arr))
    }

    /// Derive the identity belonging to a public key
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        Self(sha256(&public_key.serialize()))
    }

    /// A random identity not backed by any key
    pub fn random() -> Self {
        let mut bytes = [0u8; PEER_ID_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    /// XOR distance to another identity.
    ///
    /// Arrays compare lexicographically, which for equal-length
    /// big-endian values is numeric order.
    pub fn distance(&self, other: &PeerId) -> [u8; PEER_ID_LEN] {
        let mut out = [0u8; PEER_ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }
}

impl FromStr for PeerId {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| KeyError::InvalidPeerId(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = self.to_base58();
        write!(f, "PeerId({})", &encoded[..encoded.len().min(8)])
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base58())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Key pair identifying this node on the network
#[derive(Clone)]
pub struct NodeKey {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl NodeKey {
    /// Generate a new random node key
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut OsRng);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a node key from an existing secret key
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a node key from a hex-encoded private key
    pub fn from_private_key_hex(hex_key: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_key.trim()).map_err(|_| KeyError::InvalidPrivateKey)?;
        let secret_key = SecretKey::from_slice(&bytes).map_err(|_| KeyError::InvalidPrivateKey)?;
        Ok(Self::from_secret_key(secret_key))
    }

    /// Get the private key as a hex string
    pub fn private_key_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    /// The peer identity announced to other nodes
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_key_from_hex() {
        let key1 = NodeKey::generate();
        let key2 = NodeKey::from_private_key_hex(&key1.private_key_hex()).unwrap();
        assert_eq!(key1.peer_id(), key2.peer_id());
    }

    #[test]
    fn test_peer_id_base58_roundtrip() {
        let id = NodeKey::generate().peer_id();
        let parsed: PeerId = id.to_base58().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_peer_id_rejects_wrong_length() {
        let short = bs58::encode([1u8; 5]).into_string();
        assert!(short.parse::<PeerId>().is_err());
    }

    #[test]
    fn test_distance() {
        let a = PeerId::from_bytes([0u8; 32]);
        let mut b_bytes = [0u8; 32];
        b_bytes[31] = 0b101;
        let b = PeerId::from_bytes(b_bytes);

        assert_eq!(a.distance(&a), [0u8; 32]);
        assert_eq!(a.distance(&b), b.distance(&a));
        assert_eq!(a.distance(&b)[31], 0b101);
    }

    #[test]
    fn test_peer_id_serde() {
        let id = PeerId::random();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_base58()));
        let back: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
