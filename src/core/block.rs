//! Block carried by NEWBLOCK messages
//!
//! The p2p layer does not validate blocks; it only moves them between
//! peers and hands them to subscribers.

use crate::crypto::sha256_hex;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A block as relayed over the network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Block index/height
    pub index: u64,
    /// Hash of the previous block
    pub previous_hash: String,
    /// Block creation timestamp
    pub timestamp: DateTime<Utc>,
    /// Opaque block body
    pub data: String,
    /// Block hash
    pub hash: String,
}

impl Block {
    /// Create a new block and compute its hash
    pub fn new(index: u64, previous_hash: String, data: String) -> Self {
        let timestamp = Utc::now();
        let hash = Self::calculate_hash(index, &previous_hash, &timestamp, &data);
        Self {
            index,
            previous_hash,
            timestamp,
            data,
            hash,
        }
    }

    fn calculate_hash(
        index: u64,
        previous_hash: &str,
        timestamp: &DateTime<Utc>,
        data: &str,
    ) -> String {
        let preimage = format!(
            "{}{}{}{}",
            index,
            previous_hash,
            timestamp.timestamp_millis(),
            data
        );
        sha256_hex(preimage.as_bytes())
    }

    /// Serialize to the NEWBLOCK wire payload
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from a NEWBLOCK wire payload
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}
