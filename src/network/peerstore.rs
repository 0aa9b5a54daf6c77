//! Peer address book
//!
//! Maps peer identities to the addresses they can be dialed on. Every
//! address carries an expiry: unverified candidates get a short TTL and
//! are forgotten unless promoted, verified peers are kept indefinitely.

use crate::crypto::PeerId;
use crate::network::message::PeerInfo;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// TTL for candidate addresses that have not been verified yet
pub const TEMP_ADDR_TTL: Duration = Duration::from_secs(10);

/// TTL for addresses of peers that completed a handshake
pub const PERMANENT_ADDR_TTL: Duration = Duration::MAX;

#[derive(Debug, Clone)]
struct AddrEntry {
    addr: SocketAddr,
    /// `None` never expires
    expires: Option<Instant>,
}

impl AddrEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires.map_or(true, |at| at > now)
    }
}

fn expiry(ttl: Duration) -> Option<Instant> {
    Instant::now().checked_add(ttl)
}

/// Address book with per-address expiry
#[derive(Debug, Default)]
pub struct Peerstore {
    peers: HashMap<PeerId, Vec<AddrEntry>>,
}

impl Peerstore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an address, extending (never shortening) an existing expiry.
    /// A zero TTL removes the address.
    pub fn add_addr(&mut self, id: PeerId, addr: SocketAddr, ttl: Duration) {
        if ttl.is_zero() {
            self.remove_addr(&id, &addr);
            return;
        }

        let expires = expiry(ttl);
        let entries = self.peers.entry(id).or_default();
        match entries.iter_mut().find(|e| e.addr == addr) {
            Some(entry) => {
                entry.expires = match (entry.expires, expires) {
                    (None, _) | (_, None) => None,
                    (Some(a), Some(b)) => Some(a.max(b)),
                };
            }
            None => entries.push(AddrEntry { addr, expires }),
        }
    }

    /// Set the expiry of the given addresses exactly. A zero TTL clears them.
    pub fn set_addrs(&mut self, id: PeerId, addrs: &[SocketAddr], ttl: Duration) {
        for addr in addrs {
            if ttl.is_zero() {
                self.remove_addr(&id, addr);
                continue;
            }
            let expires = expiry(ttl);
            let entries = self.peers.entry(id).or_default();
            match entries.iter_mut().find(|e| e.addr == *addr) {
                Some(entry) => entry.expires = expires,
                None => entries.push(AddrEntry {
                    addr: *addr,
                    expires,
                }),
            }
        }
    }

    fn remove_addr(&mut self, id: &PeerId, addr: &SocketAddr) {
        if let Some(entries) = self.peers.get_mut(id) {
            entries.retain(|e| e.addr != *addr);
            if entries.is_empty() {
                self.peers.remove(id);
            }
        }
    }

    /// Live addresses of a peer, in insertion order
    pub fn addrs(&self, id: &PeerId) -> Vec<SocketAddr> {
        let now = Instant::now();
        self.peers
            .get(id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.is_live(now))
                    .map(|e| e.addr)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn peer_info(&self, id: &PeerId) -> PeerInfo {
        PeerInfo::new(*id, self.addrs(id))
    }

    /// Drop expired addresses, returning how many were removed
    pub fn gc(&mut self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.peers.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|e| e.is_live(now));
            removed += before - entries.len();
            !entries.is_empty()
        });
        removed
    }

    /// Number of peers with at least one stored address
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

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_add_and_lookup() {
        let mut store = Peerstore::new();
        let id = PeerId::random();
        store.add_addr(id, addr(1), PERMANENT_ADDR_TTL);
        store.add_addr(id, addr(2), TEMP_ADDR_TTL);
        store.add_addr(id, addr(1), TEMP_ADDR_TTL);

        assert_eq!(store.addrs(&id), vec![addr(1), addr(2)]);
        assert!(store.addrs(&PeerId::random()).is_empty());
    }

    #[test]
    fn test_zero_ttl_clears() {
        let mut store = Peerstore::new();
        let id = PeerId::random();
        store.add_addr(id, addr(1), PERMANENT_ADDR_TTL);
        store.set_addrs(id, &[addr(1)], Duration::ZERO);

        assert!(store.addrs(&id).is_empty());
        assert!(store.is_empty());

        // clearing twice is harmless
        store.set_addrs(id, &[addr(1)], Duration::ZERO);
        assert!(store.is_empty());
    }

    #[test]
    fn test_temporary_addresses_expire() {
        let mut store = Peerstore::new();
        let id = PeerId::random();
        store.add_addr(id, addr(1), Duration::from_millis(20));
        assert_eq!(store.addrs(&id), vec![addr(1)]);

        std::thread::sleep(Duration::from_millis(40));
        assert!(store.addrs(&id).is_empty());
        assert_eq!(store.gc(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_promotion_to_permanent() {
        let mut store = Peerstore::new();
        let id = PeerId::random();
        store.add_addr(id, addr(1), Duration::from_millis(20));
        store.add_addr(id, addr(1), PERMANENT_ADDR_TTL);

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(store.peer_info(&id).addrs, vec![addr(1)]);
    }
}
