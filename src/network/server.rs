//! TCP transport
//!
//! Accepts and dials peer connections. Right after the TCP connection is
//! established both sides exchange a fixed identity preamble: the 32-byte
//! peer id followed by the big-endian port the node listens on. Frames
//! follow only after the preamble.

use crate::crypto::{PeerId, PEER_ID_LEN};
use crate::network::frame::FrameCodec;
use crate::network::peer::PeerError;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

/// Size of the identity preamble
pub const IDENTITY_LEN: usize = PEER_ID_LEN + 2;

/// What a node announces about itself when a connection opens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub peer_id: PeerId,
    pub listen_port: u16,
}

impl Identity {
    fn to_bytes(self) -> [u8; IDENTITY_LEN] {
        let mut out = [0u8; IDENTITY_LEN];
        out[..PEER_ID_LEN].copy_from_slice(self.peer_id.as_bytes());
        out[PEER_ID_LEN..].copy_from_slice(&self.listen_port.to_be_bytes());
        out
    }

    fn from_bytes(buf: &[u8; IDENTITY_LEN]) -> Result<Self, PeerError> {
        let peer_id = PeerId::from_slice(&buf[..PEER_ID_LEN])
            .map_err(|e| PeerError::ConnectionFailed(e.to_string()))?;
        let listen_port = u16::from_be_bytes([buf[PEER_ID_LEN], buf[PEER_ID_LEN + 1]]);
        Ok(Self {
            peer_id,
            listen_port,
        })
    }
}

/// An established connection whose remote identity is known
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub peer_id: PeerId,
    /// Address the remote can be dialed on
    pub addr: SocketAddr,
    pub outbound: bool,
}

impl Connection {
    /// Wrap the stream in the frame codec
    pub fn framed(self, chain_id: u32, version: u8) -> Framed<TcpStream, FrameCodec> {
        Framed::new(self.stream, FrameCodec::new(chain_id, version))
    }
}

/// TCP server for accepting peer connections
pub struct Server {
    listener: TcpListener,
}

impl Server {
    /// Bind to an address and create the server
    pub async fn bind(addr: SocketAddr) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        log::info!("Server listening on {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Accept incoming connections
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), std::io::Error> {
        self.listener.accept().await
    }
}

async fn exchange_identity(
    stream: &mut TcpStream,
    local: Identity,
) -> Result<Identity, PeerError> {
    stream.write_all(&local.to_bytes()).await?;
    let mut buf = [0u8; IDENTITY_LEN];
    stream.read_exact(&mut buf).await?;
    let remote = Identity::from_bytes(&buf)?;
    if remote.peer_id == local.peer_id {
        return Err(PeerError::ConnectionFailed(
            "connected to ourselves".to_string(),
        ));
    }
    Ok(remote)
}

/// Dial a peer and exchange identities
pub async fn connect_to_peer(
    addr: SocketAddr,
    local: Identity,
    timeout: Duration,
) -> Result<Connection, PeerError> {
    let connect = async {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| PeerError::ConnectionFailed(format!("{}: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        let remote = exchange_identity(&mut stream, local).await?;
        Ok::<_, PeerError>((stream, remote))
    };

    let (stream, remote) = tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| PeerError::ConnectionFailed(format!("{}: connect timed out", addr)))??;

    Ok(Connection {
        stream,
        peer_id: remote.peer_id,
        addr,
        outbound: true,
    })
}

/// Complete an inbound connection by exchanging identities
pub async fn accept_connection(
    mut stream: TcpStream,
    remote_addr: SocketAddr,
    local: Identity,
    timeout: Duration,
) -> Result<Connection, PeerError> {
    stream.set_nodelay(true)?;
    let remote = tokio::time::timeout(timeout, exchange_identity(&mut stream, local))
        .await
        .map_err(|_| {
            PeerError::ConnectionFailed(format!("{}: identity exchange timed out", remote_addr))
        })??;

    Ok(Connection {
        stream,
        peer_id: remote.peer_id,
        addr: SocketAddr::new(remote_addr.ip(), remote.listen_port),
        outbound: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(port: u16) -> Identity {
        Identity {
            peer_id: PeerId::random(),
            listen_port: port,
        }
    }

    #[test]
    fn test_identity_bytes() {
        let id = identity(8333);
        assert_eq!(Identity::from_bytes(&id.to_bytes()).unwrap(), id);
    }

    #[tokio::test]
    async fn test_connect_and_accept() {
        let server = Server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let server_id = identity(server_addr.port());
        let client_id = identity(4444);

        let accept = tokio::spawn(async move {
            let (stream, remote) = server.accept().await.unwrap();
            accept_connection(stream, remote, server_id, Duration::from_secs(2))
                .await
                .unwrap()
        });

        let outbound = connect_to_peer(server_addr, client_id, Duration::from_secs(2))
            .await
            .unwrap();
        let inbound = accept.await.unwrap();

        assert_eq!(outbound.peer_id, server_id.peer_id);
        assert_eq!(outbound.addr, server_addr);
        assert!(outbound.outbound);
        assert_eq!(inbound.peer_id, client_id.peer_id);
        assert_eq!(inbound.addr, "127.0.0.1:4444".parse().unwrap());
        assert!(!inbound.outbound);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // bind then drop to get a port nobody listens on
        let addr = {
            let server = Server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
            server.local_addr().unwrap()
        };
        let result = connect_to_peer(addr, identity(1), Duration::from_secs(2)).await;
        assert!(matches!(result, Err(PeerError::ConnectionFailed(_))));
    }
}
