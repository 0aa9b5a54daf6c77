//! P2P Node implementation
//!
//! The node owns the shared network state (sessions, peerstore, route
//! table, dispatcher) and orchestrates its lifecycle: listening for
//! inbound connections, greeting bootstrap peers, running discovery and
//! shutting everything down again.

use crate::core::Block;
use crate::crypto::{NodeKey, PeerId};
use crate::network::dispatcher::{Dispatcher, Subscriber, DEFAULT_QUEUE_SIZE};
use crate::network::message::{NetMessage, PeerInfo, TaggedMessage, PROTOCOL_VERSION};
use crate::network::peer::{ConnectionStatus, PeerError, SessionStore};
use crate::network::peerstore::{Peerstore, PERMANENT_ADDR_TTL};
use crate::network::route_table::RouteTable;
use crate::network::server::{accept_connection, Identity, Server};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// P2P Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Interface to listen on
    pub host: IpAddr,
    /// Port to listen on (0 picks a free port)
    pub port: u16,
    /// Chain this node belongs to; frames from other chains are rejected
    pub chain_id: u32,
    /// Protocol version byte; frames with another version are rejected
    pub version: u8,
    /// Maximum number of peers returned for one route sync request
    pub max_sync_nodes: usize,
    /// Initial peers to connect to
    pub bootstrap_peers: Vec<SocketAddr>,
    pub connect_timeout_ms: u64,
    /// How long to wait for a peer's OK after sending HELLO
    pub handshake_timeout_ms: u64,
    pub discovery_interval_secs: u64,
    /// Upper bound on concurrent broadcast sends
    pub max_broadcast_sends: usize,
    pub dispatcher_queue_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8680,
            chain_id: 1,
            version: PROTOCOL_VERSION,
            max_sync_nodes: 20,
            bootstrap_peers: Vec::new(),
            connect_timeout_ms: 5_000,
            handshake_timeout_ms: 5_000,
            discovery_interval_secs: 30,
            max_broadcast_sends: 64,
            dispatcher_queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

impl NodeConfig {
    /// Load a configuration from a JSON file; missing fields take defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs.max(1))
    }
}

/// State shared by every task of a node
pub(crate) struct NodeState {
    pub(crate) config: NodeConfig,
    pub(crate) local_id: PeerId,
    pub(crate) sessions: SessionStore,
    pub(crate) peerstore: RwLock<Peerstore>,
    pub(crate) route_table: RwLock<RouteTable>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    /// Root of every task's cancellation
    pub(crate) shutdown: CancellationToken,
    pub(crate) broadcast_permits: Arc<Semaphore>,
    pub(crate) next_conn_id: AtomicU64,
    /// Inbound connections that completed the identity exchange
    inbound_accepted: AtomicU64,
    listen_port: AtomicU16,
    running: AtomicBool,
}

impl NodeState {
    /// What we announce to peers when a connection opens
    pub(crate) fn identity(&self) -> Identity {
        Identity {
            peer_id: self.local_id,
            listen_port: self.listen_port.load(Ordering::Relaxed),
        }
    }

    async fn accept_loop(self: Arc<Self>, server: Server) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = server.accept() => match accepted {
                    Ok((stream, remote)) => {
                        log::debug!("Incoming connection from {}", remote);
                        let state = Arc::clone(&self);
                        tokio::spawn(async move {
                            let timeout = state.config.connect_timeout();
                            let local = state.identity();
                            match accept_connection(stream, remote, local, timeout).await {
                                Ok(conn) => {
                                    state.inbound_accepted.fetch_add(1, Ordering::Relaxed);
                                    state.serve_inbound(conn);
                                }
                                Err(e) => log::warn!("Rejected connection from {}: {}", remote, e),
                            }
                        });
                    }
                    Err(e) => log::error!("Accept error: {}", e),
                },
            }
        }
        log::info!("Stopped accepting connections");
    }
}

/// The main P2P node
#[derive(Clone)]
pub struct Node {
    state: Arc<NodeState>,
}

impl Node {
    /// Create a node with a freshly generated key
    pub fn new(config: NodeConfig) -> Self {
        Self::with_key(config, &NodeKey::generate())
    }

    pub fn with_key(config: NodeConfig, key: &NodeKey) -> Self {
        let local_id = key.peer_id();
        let state = NodeState {
            local_id,
            sessions: SessionStore::new(),
            peerstore: RwLock::new(Peerstore::new()),
            route_table: RwLock::new(RouteTable::new(local_id)),
            dispatcher: Arc::new(Dispatcher::new(config.dispatcher_queue_size)),
            shutdown: CancellationToken::new(),
            broadcast_permits: Arc::new(Semaphore::new(config.max_broadcast_sends.max(1))),
            next_conn_id: AtomicU64::new(1),
            inbound_accepted: AtomicU64::new(0),
            listen_port: AtomicU16::new(config.port),
            running: AtomicBool::new(false),
            config,
        };
        Self {
            state: Arc::new(state),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.state.local_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.state.config
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Address other nodes can reach us on, once launched
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(
            self.state.config.host,
            self.state.listen_port.load(Ordering::Relaxed),
        )
    }

    /// Join the network.
    ///
    /// Fails if the node has been launched before. Individual bootstrap
    /// failures are logged and do not fail the launch.
    pub async fn launch(&self) -> Result<(), PeerError> {
        let state = &self.state;
        if state.running.swap(true, Ordering::SeqCst) {
            return Err(PeerError::AlreadyRunning);
        }
        log::info!("Launching node {}", state.local_id);

        let server = Server::bind(state.config.listen_addr()).await?;
        let bound = server.local_addr()?;
        state.listen_port.store(bound.port(), Ordering::Relaxed);
        tokio::spawn(Arc::clone(state).accept_loop(server));

        let greetings = state.config.bootstrap_peers.iter().map(|addr| {
            let state = Arc::clone(state);
            let addr = *addr;
            async move {
                match state.say_hello(addr).await {
                    Ok(peer_id) => log::info!("Bootstrap peer {} at {} is up", peer_id, addr),
                    Err(e) => log::error!("Cannot say hello to bootstrap peer {}: {}", addr, e),
                }
            }
        });
        futures::future::join_all(greetings).await;

        tokio::spawn(Arc::clone(state).discovery_loop());
        state.dispatcher.start().await;

        log::info!(
            "Node {} joined the network, listening on {}",
            state.local_id,
            bound
        );
        Ok(())
    }

    /// Stop the dispatcher and terminate every connection
    pub async fn stop(&self) {
        self.state.dispatcher.stop();
        self.state.shutdown.cancel();
        self.state.sessions.clear().await;
        log::info!("Node {} stopped", self.state.local_id);
    }

    /// Handshake with a peer whose address is in the peerstore
    pub async fn hello(&self, peer_id: PeerId) -> Result<(), PeerError> {
        self.state.hello(peer_id).await
    }

    /// Handshake with whoever listens on `addr`, returning its identity
    pub async fn say_hello(&self, addr: SocketAddr) -> Result<PeerId, PeerError> {
        self.state.say_hello(addr).await
    }

    /// Forget a peer locally
    pub async fn bye(&self, peer_id: PeerId, addrs: &[SocketAddr]) {
        self.state.bye(peer_id, addrs).await
    }

    /// Ask a connected peer for the peers nearest to us
    pub async fn sync_routes(&self, peer_id: PeerId) -> Result<(), PeerError> {
        self.state.sync_routes(peer_id).await
    }

    /// Send a message to every known peer, returning how many sends were started
    pub async fn broadcast(&self, msg: NetMessage) -> Result<usize, PeerError> {
        self.state.broadcast(msg).await
    }

    pub async fn broadcast_block(&self, block: Block) -> Result<usize, PeerError> {
        self.broadcast(NetMessage::NewBlock(block)).await
    }

    /// Send a raw named message to one peer
    pub async fn send_msg(
        &self,
        name: &str,
        payload: Vec<u8>,
        peer_id: PeerId,
    ) -> Result<(), PeerError> {
        self.state.send_msg(name, payload.into(), peer_id).await
    }

    pub async fn register(&self, subscribers: &[Subscriber]) {
        self.state.dispatcher.register(subscribers).await
    }

    pub async fn deregister(&self, subscribers: &[Subscriber]) {
        self.state.dispatcher.deregister(subscribers).await
    }

    pub fn put_message(&self, msg: TaggedMessage) {
        self.state.dispatcher.put_message(msg)
    }

    /// Add a known peer to the peerstore and route table without a handshake
    pub async fn add_route(&self, info: PeerInfo) -> bool {
        if info.id == self.state.local_id {
            return false;
        }
        {
            let mut peerstore = self.state.peerstore.write().await;
            for addr in &info.addrs {
                peerstore.add_addr(info.id, *addr, PERMANENT_ADDR_TTL);
            }
        }
        self.state.route_table.write().await.update(info.id)
    }

    /// Peers a SYNCROUTE from `target` would be answered with
    pub async fn nearest_peers(&self, target: &PeerId, k: usize) -> Vec<PeerInfo> {
        self.state.nearest_peer_infos(target, k).await
    }

    pub async fn route_table_peers(&self) -> Vec<PeerId> {
        self.state.route_table.read().await.list_peers()
    }

    pub async fn known_addrs(&self, peer_id: &PeerId) -> Vec<SocketAddr> {
        self.state.peerstore.read().await.addrs(peer_id)
    }

    pub async fn connection_status(&self, addr: &SocketAddr) -> ConnectionStatus {
        self.state.sessions.status(addr).await
    }

    /// Get node status
    pub async fn status(&self) -> NodeStatus {
        NodeStatus {
            peer_id: self.state.local_id,
            listen_addr: self.local_addr(),
            running: self.is_running(),
            route_table_size: self.state.route_table.read().await.len(),
            connected_peers: self.state.sessions.connected_count().await,
            inbound_connections: self.state.inbound_accepted.load(Ordering::Relaxed),
        }
    }
}

/// Node status information
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub peer_id: PeerId,
    pub listen_addr: SocketAddr,
    pub running: bool,
    pub route_table_size: usize,
    pub connected_peers: usize,
    /// Inbound connections accepted since launch
    pub inbound_connections: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn local_config() -> NodeConfig {
        NodeConfig {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"chain_id": 7, "max_sync_nodes": 5, "bootstrap_peers": ["127.0.0.1:9000"]}}"#
        )
        .unwrap();

        let config = NodeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.chain_id, 7);
        assert_eq!(config.max_sync_nodes, 5);
        assert_eq!(config.bootstrap_peers, vec!["127.0.0.1:9000".parse().unwrap()]);
        assert_eq!(config.version, PROTOCOL_VERSION);
        assert_eq!(config.port, 8680);
    }

    #[test]
    fn test_config_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            NodeConfig::from_file(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_node_creation() {
        let node = Node::new(local_config());
        let status = node.status().await;

        assert_eq!(status.peer_id, node.peer_id());
        assert!(!status.running);
        assert_eq!(status.route_table_size, 0);
        assert_eq!(status.connected_peers, 0);
        assert_eq!(status.inbound_connections, 0);
    }

    #[tokio::test]
    async fn test_launch_twice_fails() {
        let node = Node::new(local_config());
        node.launch().await.unwrap();
        assert!(node.is_running());
        assert_ne!(node.local_addr().port(), 0);

        assert!(matches!(node.launch().await, Err(PeerError::AlreadyRunning)));
        node.stop().await;
        // running is a one-way latch
        assert!(matches!(node.launch().await, Err(PeerError::AlreadyRunning)));
    }

    #[tokio::test]
    async fn test_add_route_skips_self() {
        let node = Node::new(local_config());
        let own = PeerInfo::new(node.peer_id(), vec!["127.0.0.1:1".parse().unwrap()]);
        assert!(!node.add_route(own).await);

        let other = PeerInfo::new(PeerId::random(), vec!["127.0.0.1:2".parse().unwrap()]);
        assert!(node.add_route(other.clone()).await);
        assert_eq!(node.route_table_peers().await, vec![other.id]);
        assert_eq!(node.known_addrs(&other.id).await, other.addrs);
    }
}
