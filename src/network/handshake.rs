//! HELLO/OK/BYE handshake
//!
//! The dialing side sends HELLO and waits, bounded by the handshake
//! timeout, for exactly one reply on the fresh connection. Only an OK
//! carrying the literal payload "ok" establishes the session; after that
//! the connection is handed to the regular stream handler.

use crate::crypto::PeerId;
use crate::network::frame::Frame;
use crate::network::message::{MessageKind, HELLO, OK};
use crate::network::node::NodeState;
use crate::network::peer::{ConnectionStatus, PeerError};
use crate::network::server::{connect_to_peer, Connection};
use futures::stream::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

impl NodeState {
    /// Handshake with a peer at its first known address
    pub(crate) async fn hello(self: &Arc<Self>, peer_id: PeerId) -> Result<(), PeerError> {
        let addr = {
            let peerstore = self.peerstore.read().await;
            peerstore.addrs(&peer_id).first().copied()
        };
        let addr = addr
            .ok_or_else(|| PeerError::Handshake(format!("no known address for {}", peer_id)))?;

        log::info!("Saying hello to {} at {}", peer_id, addr);
        let result = async {
            let conn =
                connect_to_peer(addr, self.identity(), self.config.connect_timeout()).await?;
            if conn.peer_id != peer_id {
                return Err(PeerError::Handshake(format!(
                    "{} answered as {} instead of {}",
                    addr, conn.peer_id, peer_id
                )));
            }
            self.complete_handshake(conn).await
        }
        .await;

        if let Err(e) = &result {
            log::warn!("Hello to {} at {} failed: {}", peer_id, addr, e);
            self.forget_unless_connected(peer_id, addr).await;
        }
        result
    }

    /// Handshake with whoever listens on `addr`
    pub(crate) async fn say_hello(
        self: &Arc<Self>,
        addr: SocketAddr,
    ) -> Result<PeerId, PeerError> {
        log::info!("Saying hello to {}", addr);
        let conn = connect_to_peer(addr, self.identity(), self.config.connect_timeout()).await?;
        let peer_id = conn.peer_id;

        match self.complete_handshake(conn).await {
            Ok(()) => Ok(peer_id),
            Err(e) => {
                self.forget_unless_connected(peer_id, addr).await;
                Err(e)
            }
        }
    }

    async fn complete_handshake(self: &Arc<Self>, conn: Connection) -> Result<(), PeerError> {
        let (ctx, mut reader) = self.open_channel(conn);

        let outcome = async {
            ctx.handle.send(Frame::from_kind(MessageKind::Hello, HELLO)).await?;

            let wait = self.config.handshake_timeout();
            let reply = tokio::time::timeout(wait, reader.next())
                .await
                .map_err(|_| PeerError::HandshakeTimeout)?;

            match reply {
                Some(Ok(frame)) => check_ok_reply(&frame),
                Some(Err(e)) => Err(e.into()),
                None => Err(PeerError::Handshake(
                    "connection closed before reply".to_string(),
                )),
            }
        }
        .await;

        match outcome {
            Ok(()) => {
                // a losing duplicate is already cancelled; the peer stays
                // reachable over the connection that won
                if self.register_session(&ctx).await {
                    self.spawn_connection(ctx, reader);
                }
                Ok(())
            }
            Err(e) => {
                ctx.token.cancel();
                Err(e)
            }
        }
    }

    /// Run `bye` for a failed dial unless another connection to the same
    /// address is still live
    async fn forget_unless_connected(&self, peer_id: PeerId, addr: SocketAddr) {
        if self.sessions.handle_for(&addr).await.is_some() {
            log::debug!("Keeping {} at {}: another connection is live", peer_id, addr);
            return;
        }
        self.bye(peer_id, &[addr]).await;
    }

    /// Forget a peer locally: clear its addresses, drop it from the route
    /// table and mark its first address disconnected. Idempotent.
    pub(crate) async fn bye(&self, peer_id: PeerId, addrs: &[SocketAddr]) {
        self.peerstore
            .write()
            .await
            .set_addrs(peer_id, addrs, Duration::ZERO);
        self.route_table.write().await.remove(&peer_id);
        if let Some(first) = addrs.first() {
            self.sessions
                .set_status(first, ConnectionStatus::Disconnected)
                .await;
        }
        log::debug!("Bye to {}", peer_id);
    }
}

fn check_ok_reply(frame: &Frame) -> Result<(), PeerError> {
    match frame.kind() {
        Some(MessageKind::Ok) if frame.payload.as_ref() == OK.as_bytes() => Ok(()),
        Some(MessageKind::Ok) => Err(PeerError::Handshake(
            "say hello got an incorrect ok response".to_string(),
        )),
        _ => Err(PeerError::Handshake(format!(
            "expected ok reply, got {:?}",
            frame.name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_ok_reply() {
        assert!(check_ok_reply(&Frame::new(OK, OK)).is_ok());
        assert!(matches!(
            check_ok_reply(&Frame::new(OK, "nope")),
            Err(PeerError::Handshake(_))
        ));
        assert!(matches!(
            check_ok_reply(&Frame::new(HELLO, HELLO)),
            Err(PeerError::Handshake(_))
        ));
    }
}
