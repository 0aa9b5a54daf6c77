//! Peer sessions for P2P networking
//!
//! Tracks the open send-handle and connection status of every peer
//! address, and defines the errors raised while talking to peers.

use crate::crypto::PeerId;
use crate::network::frame::{Frame, FrameError};
use std::collections::HashMap;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Handshake timed out")]
    HandshakeTimeout,
    #[error("Dispatch failed: {0}")]
    Dispatch(String),
    #[error("No session for peer {0}")]
    NoSession(PeerId),
    #[error("Peer disconnected")]
    Disconnected,
    #[error("Node already running")]
    AlreadyRunning,
}

/// Connection state of a peer address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connected,
}

/// Handle for sending frames to a peer
///
/// Frames are queued to the connection's writer task; the socket closes
/// once every handle for it has been dropped.
#[derive(Clone, Debug)]
pub struct PeerHandle {
    pub addr: SocketAddr,
    pub tx: mpsc::Sender<Frame>,
}

impl PeerHandle {
    pub async fn send(&self, frame: Frame) -> Result<(), PeerError> {
        self.tx.send(frame).await.map_err(|_| PeerError::Disconnected)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Registered state for one peer address
#[derive(Clone, Debug)]
pub struct Session {
    /// Connection that owns this session
    pub conn_id: u64,
    pub peer_id: PeerId,
    /// Node that opened the connection
    pub dialer: PeerId,
    pub handle: PeerHandle,
    pub status: ConnectionStatus,
    /// Cancels the owning connection
    pub token: CancellationToken,
}

impl Session {
    pub fn connected(
        conn_id: u64,
        peer_id: PeerId,
        dialer: PeerId,
        handle: PeerHandle,
        token: CancellationToken,
    ) -> Self {
        Self {
            conn_id,
            peer_id,
            dialer,
            handle,
            status: ConnectionStatus::Connected,
            token,
        }
    }
}

/// Concurrency-safe map from peer address to session
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<SocketAddr, Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the session registered for an address
    pub async fn get(&self, addr: &SocketAddr) -> Option<Session> {
        let sessions = self.sessions.read().await;
        sessions.get(addr).cloned()
    }

    /// Register a session and close whichever connection loses the address.
    ///
    /// A newer connection replaces the older one, except when both peers
    /// dialed each other at once: then both sides keep the connection opened
    /// by the smaller peer id. Returns false if `session` lost; its
    /// connection has been cancelled.
    pub async fn put(&self, addr: SocketAddr, session: Session) -> bool {
        let mut sessions = self.sessions.write().await;
        if let Some(old) = sessions.get(&addr) {
            let crossed = old.conn_id != session.conn_id
                && old.status == ConnectionStatus::Connected
                && old.dialer != session.dialer;
            if crossed && old.dialer < session.dialer {
                log::debug!(
                    "Keeping session {} for {}, closing connection {}",
                    old.conn_id,
                    addr,
                    session.conn_id
                );
                session.token.cancel();
                return false;
            }
        }

        let conn_id = session.conn_id;
        if let Some(old) = sessions.insert(addr, session) {
            if old.conn_id != conn_id {
                log::debug!("Replaced session {} for {}", old.conn_id, addr);
                old.token.cancel();
            }
        }
        true
    }

    /// Remove a session
    pub async fn remove(&self, addr: &SocketAddr) -> Option<Session> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(addr)
    }

    /// Remove the session for `addr` only if it belongs to `conn_id`
    pub async fn remove_if(&self, addr: &SocketAddr, conn_id: u64) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(addr) {
            Some(session) if session.conn_id == conn_id => {
                sessions.remove(addr);
                true
            }
            _ => false,
        }
    }

    /// Update the status of a registered address
    pub async fn set_status(&self, addr: &SocketAddr, status: ConnectionStatus) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(addr) {
            Some(session) => {
                session.status = status;
                true
            }
            None => false,
        }
    }

    /// Status of an address; unknown addresses are disconnected
    pub async fn status(&self, addr: &SocketAddr) -> ConnectionStatus {
        let sessions = self.sessions.read().await;
        sessions
            .get(addr)
            .map(|s| s.status)
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    /// Send-handle of a connected session whose writer is still running
    pub async fn handle_for(&self, addr: &SocketAddr) -> Option<PeerHandle> {
        let sessions = self.sessions.read().await;
        sessions
            .get(addr)
            .filter(|s| s.status == ConnectionStatus::Connected && !s.handle.is_closed())
            .map(|s| s.handle.clone())
    }

    /// Number of connected sessions
    pub async fn connected_count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|s| s.status == ConnectionStatus::Connected)
            .count()
    }

    /// Drop every session, closing its connection
    pub async fn clear(&self) {
        let mut sessions = self.sessions.write().await;
        for (_, session) in sessions.drain() {
            session.token.cancel();
        }
    }
}
