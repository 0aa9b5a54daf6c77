//! Route table for peer discovery
//!
//! Kademlia-style set of reachable peers keyed by identity and queried
//! by XOR distance. The local node's own identity is never stored.

use crate::crypto::PeerId;
use std::collections::HashMap;
use std::time::Instant;

/// Default upper bound on route table size
pub const MAX_ROUTE_TABLE_PEERS: usize = 1024;

/// XOR-metric route table
#[derive(Debug)]
pub struct RouteTable {
    local_id: PeerId,
    /// Peer identity -> last time it proved reachable
    peers: HashMap<PeerId, Instant>,
    capacity: usize,
}

impl RouteTable {
    pub fn new(local_id: PeerId) -> Self {
        Self::with_capacity(local_id, MAX_ROUTE_TABLE_PEERS)
    }

    pub fn with_capacity(local_id: PeerId, capacity: usize) -> Self {
        Self {
            local_id,
            peers: HashMap::new(),
            capacity,
        }
    }

    /// Insert or refresh a peer. Returns false for the local identity or
    /// when a new peer does not fit.
    pub fn update(&mut self, id: PeerId) -> bool {
        if id == self.local_id {
            return false;
        }
        if !self.peers.contains_key(&id) && self.peers.len() >= self.capacity {
            log::debug!("Route table full, dropping {}", id);
            return false;
        }
        self.peers.insert(id, Instant::now());
        true
    }

    pub fn remove(&mut self, id: &PeerId) -> bool {
        self.peers.remove(id).is_some()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    /// Up to `k` peers ordered by ascending XOR distance to `target`
    pub fn nearest(&self, target: &PeerId, k: usize) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.peers.keys().copied().collect();
        peers.sort_by_key(|id| id.distance(target));
        peers.truncate(k);
        peers
    }

    pub fn list_peers(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn id_with_last_byte(b: u8) -> PeerId {
        let mut bytes = [0u8; 32];
        bytes[31] = b;
        PeerId::from_bytes(bytes)
    }

    #[test]
    fn test_never_contains_self() {
        let local = PeerId::random();
        let mut table = RouteTable::new(local);
        assert!(!table.update(local));

        for _ in 0..50 {
            table.update(PeerId::random());
            table.update(local);
        }
        assert!(!table.contains(&local));
        assert!(!table.list_peers().contains(&local));
        assert_eq!(table.len(), 50);
    }

    #[test]
    fn test_update_is_idempotent() {
        let mut table = RouteTable::new(PeerId::random());
        let peer = PeerId::random();
        assert!(table.update(peer));
        assert!(table.update(peer));
        assert_eq!(table.len(), 1);

        assert!(table.remove(&peer));
        assert!(!table.remove(&peer));
        assert!(table.is_empty());
    }

    #[test]
    fn test_nearest_orders_by_xor_distance() {
        let mut table = RouteTable::new(id_with_last_byte(0xFF));
        for b in [0b0001, 0b0010, 0b0100, 0b1000, 0b1111] {
            table.update(id_with_last_byte(b));
        }

        let target = id_with_last_byte(0b0011);
        let nearest = table.nearest(&target, 3);
        // distances: 0b0001->2, 0b0010->1, 0b0100->7, 0b1000->11, 0b1111->12
        assert_eq!(
            nearest,
            vec![
                id_with_last_byte(0b0010),
                id_with_last_byte(0b0001),
                id_with_last_byte(0b0100)
            ]
        );
    }

    #[test]
    fn test_nearest_returns_exactly_k_sorted_unique() {
        let mut table = RouteTable::new(PeerId::random());
        for _ in 0..40 {
            table.update(PeerId::random());
        }
        let target = PeerId::random();
        let nearest = table.nearest(&target, 20);

        assert_eq!(nearest.len(), 20);
        let unique: HashSet<_> = nearest.iter().collect();
        assert_eq!(unique.len(), 20);
        for pair in nearest.windows(2) {
            assert!(pair[0].distance(&target) < pair[1].distance(&target));
        }

        // everything left out is at least as far as the furthest returned
        let furthest = nearest[19].distance(&target);
        for peer in table.list_peers() {
            if !nearest.contains(&peer) {
                assert!(peer.distance(&target) > furthest);
            }
        }
    }

    #[test]
    fn test_nearest_with_fewer_than_k() {
        let mut table = RouteTable::new(PeerId::random());
        table.update(PeerId::random());
        table.update(PeerId::random());
        assert_eq!(table.nearest(&PeerId::random(), 20).len(), 2);
    }

    #[test]
    fn test_capacity() {
        let mut table = RouteTable::with_capacity(PeerId::random(), 2);
        let a = PeerId::random();
        assert!(table.update(a));
        assert!(table.update(PeerId::random()));
        assert!(!table.update(PeerId::random()));
        assert!(table.update(a));
        assert_eq!(table.len(), 2);
    }
}
