//! Route discovery for P2P networking
//!
//! Grows the route table through SYNCROUTE exchanges:
//! - A node asks a connected peer for the peers nearest to itself
//! - The peer answers with up to `max_sync_nodes` entries by XOR distance
//! - Every unknown candidate is verified with a handshake before it is
//!   added to the route table

use crate::crypto::PeerId;
use crate::network::frame::Frame;
use crate::network::handler::ConnContext;
use crate::network::message::{MessageKind, PeerInfo, SYNCROUTE};
use crate::network::node::NodeState;
use crate::network::peer::{PeerError, PeerHandle};
use crate::network::peerstore::{PERMANENT_ADDR_TTL, TEMP_ADDR_TTL};
use rand::seq::SliceRandom;
use std::sync::Arc;

// =============================================================================
// Constants
// =============================================================================

/// Peers asked for routes in one discovery round
const DISCOVERY_FANOUT: usize = 8;

// =============================================================================
// Route Sync
// =============================================================================

impl NodeState {
    /// Send-handle of the session registered for a peer's first address
    pub(crate) async fn session_for_peer(&self, peer_id: &PeerId) -> Option<PeerHandle> {
        let addr = {
            let peerstore = self.peerstore.read().await;
            peerstore.addrs(peer_id).first().copied()
        }?;
        self.sessions.handle_for(&addr).await
    }

    /// Ask a connected peer for routes. The reply is processed by that
    /// peer's stream handler.
    pub(crate) async fn sync_routes(&self, peer_id: PeerId) -> Result<(), PeerError> {
        log::debug!("Syncing routes from {}", peer_id);
        let handle = self
            .session_for_peer(&peer_id)
            .await
            .ok_or(PeerError::NoSession(peer_id))?;
        handle
            .send(Frame::from_kind(MessageKind::SyncRoute, SYNCROUTE))
            .await
    }

    /// The `k` route table entries nearest to `target` that have a known
    /// address, excluding `target` itself
    pub(crate) async fn nearest_peer_infos(&self, target: &PeerId, k: usize) -> Vec<PeerInfo> {
        let ranked = {
            let table = self.route_table.read().await;
            table.nearest(target, table.len())
        };

        let peerstore = self.peerstore.read().await;
        ranked
            .into_iter()
            .filter(|id| id != target)
            .map(|id| peerstore.peer_info(&id))
            .filter(|info| {
                if info.addrs.is_empty() {
                    log::debug!("No address for {}, leaving it out of route sync", info.id);
                    return false;
                }
                true
            })
            .take(k)
            .collect()
    }

    /// Answer a SYNCROUTE request over the requester's session
    pub(crate) async fn handle_sync_route(&self, ctx: &ConnContext) -> Result<(), PeerError> {
        let peers = self
            .nearest_peer_infos(&ctx.peer_id, self.config.max_sync_nodes)
            .await;
        let data = PeerInfo::encode_list(&peers)?;

        let handle = match self.sessions.handle_for(&ctx.addr).await {
            Some(handle) => handle,
            None => {
                log::error!(
                    "Cannot answer route sync: {}",
                    PeerError::NoSession(ctx.peer_id)
                );
                return Ok(());
            }
        };
        handle
            .send(Frame::from_kind(MessageKind::SyncRouteReply, data))
            .await?;
        log::info!("Sent {} routes to {}", peers.len(), ctx.peer_id);

        self.route_table.write().await.update(ctx.peer_id);
        Ok(())
    }

    /// Process a SYNCROUTEREPLY payload
    pub(crate) async fn handle_sync_route_reply(
        self: &Arc<Self>,
        ctx: &ConnContext,
        payload: &[u8],
    ) -> Result<(), PeerError> {
        let candidates = PeerInfo::decode_list(payload)?;
        log::info!(
            "Got {} route candidates from {}",
            candidates.len(),
            ctx.peer_id
        );
        let added = self.verify_candidates(candidates).await;
        log::info!("Added {} peers from {}", added, ctx.peer_id);
        Ok(())
    }

    /// Handshake with every unknown candidate and keep the ones that answer.
    /// Returns the number of peers added to the route table.
    pub(crate) async fn verify_candidates(self: &Arc<Self>, candidates: Vec<PeerInfo>) -> usize {
        let mut added = 0;
        for candidate in candidates {
            let known = candidate.id == self.local_id
                || self.route_table.read().await.contains(&candidate.id);
            let addr = match candidate.addrs.first() {
                Some(addr) if !known => *addr,
                _ => {
                    log::debug!("Skipping route candidate {}", candidate.id);
                    continue;
                }
            };

            self.peerstore
                .write()
                .await
                .add_addr(candidate.id, addr, TEMP_ADDR_TTL);

            if let Err(e) = self.hello(candidate.id).await {
                log::warn!("Route candidate {} at {} unreachable: {}", candidate.id, addr, e);
                continue;
            }

            self.peerstore
                .write()
                .await
                .add_addr(candidate.id, addr, PERMANENT_ADDR_TTL);
            if self.route_table.write().await.update(candidate.id) {
                added += 1;
            }
        }
        added
    }

    // =========================================================================
    // Discovery Loop
    // =========================================================================

    /// Ask a random subset of known peers for routes
    pub(crate) async fn discovery_round(&self) {
        let removed = self.peerstore.write().await.gc();
        if removed > 0 {
            log::debug!("Expired {} peer addresses", removed);
        }

        let targets: Vec<PeerId> = {
            let peers = self.route_table.read().await.list_peers();
            let mut rng = rand::thread_rng();
            peers
                .choose_multiple(&mut rng, DISCOVERY_FANOUT)
                .copied()
                .collect()
        };

        for peer_id in targets {
            if let Err(e) = self.sync_routes(peer_id).await {
                log::debug!("Route sync with {} skipped: {}", peer_id, e);
            }
        }
    }

    pub(crate) async fn discovery_loop(self: Arc<Self>) {
        let period = self.config.discovery_interval();
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        log::info!("Discovery running every {:?}", period);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => self.discovery_round().await,
            }
        }
        log::info!("Stopped discovery");
    }
}
