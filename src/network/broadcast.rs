//! Message broadcast
//!
//! Fans a message out to every peer in the route table. Each send runs
//! as its own task; a semaphore bounds how many run at once.

use crate::crypto::PeerId;
use crate::network::frame::Frame;
use crate::network::message::NetMessage;
use crate::network::node::NodeState;
use crate::network::peer::PeerError;
use bytes::Bytes;
use std::sync::Arc;

impl NodeState {
    /// Send a named message to one peer over its registered session
    pub(crate) async fn send_msg(
        &self,
        name: &str,
        payload: Bytes,
        peer_id: PeerId,
    ) -> Result<(), PeerError> {
        let handle = self
            .session_for_peer(&peer_id)
            .await
            .ok_or(PeerError::NoSession(peer_id))?;
        handle.send(Frame::new(name, payload)).await
    }

    /// Start one send per known peer except ourselves and return how many
    /// were started. Does not wait for delivery.
    pub(crate) async fn broadcast(self: &Arc<Self>, msg: NetMessage) -> Result<usize, PeerError> {
        let name = msg.kind().name();
        let payload = Bytes::from(msg.to_payload()?);
        let peers = self.route_table.read().await.list_peers();
        log::info!("Broadcasting {} to {} peers", name, peers.len());

        let mut started = 0;
        for peer_id in peers {
            if peer_id == self.local_id {
                log::warn!("Broadcast: skip self");
                continue;
            }

            let permit = match Arc::clone(&self.broadcast_permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let state = Arc::clone(self);
            let payload = payload.clone();
            tokio::spawn(async move {
                let _permit = permit;
                match state.send_msg(name, payload, peer_id).await {
                    Ok(()) => log::debug!("Sent {} to {}", name, peer_id),
                    Err(e @ PeerError::NoSession(_)) => log::warn!("Broadcast: {}", e),
                    Err(e) => log::warn!("Broadcast to {} failed: {}", peer_id, e),
                }
            });
            started += 1;
        }
        Ok(started)
    }
}
