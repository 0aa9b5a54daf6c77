//! Per-connection stream handler
//!
//! Every connection gets a writer task draining its send queue and a
//! reader loop that validates frames and routes them by message name.
//! Frames of one connection are handled strictly in arrival order.

use crate::core::Block;
use crate::crypto::PeerId;
use crate::network::frame::{Frame, FrameCodec};
use crate::network::message::{MessageKind, NetMessage, TaggedMessage, OK};
use crate::network::node::NodeState;
use crate::network::peer::{PeerError, PeerHandle, Session};
use crate::network::peerstore::PERMANENT_ADDR_TTL;
use crate::network::server::Connection;
use futures::sink::SinkExt;
use futures::stream::{SplitStream, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

/// Frames queued per connection before senders wait
const SEND_QUEUE_SIZE: usize = 100;

pub(crate) type FrameReader = SplitStream<Framed<TcpStream, FrameCodec>>;

/// Everything a handler needs to know about its connection
#[derive(Clone)]
pub(crate) struct ConnContext {
    pub(crate) conn_id: u64,
    pub(crate) peer_id: PeerId,
    pub(crate) addr: SocketAddr,
    pub(crate) handle: PeerHandle,
    pub(crate) outbound: bool,
    /// Cancelled on shutdown or when this connection ends
    pub(crate) token: CancellationToken,
}

impl ConnContext {
    fn dialer(&self, local_id: PeerId) -> PeerId {
        if self.outbound {
            local_id
        } else {
            self.peer_id
        }
    }
}

/// Why a read loop ended
enum LoopExit {
    Cancelled,
    Closed,
    Failed(PeerError),
}

impl NodeState {
    /// Split a connection into a queued send-handle and a frame reader
    pub(crate) fn open_channel(&self, conn: Connection) -> (ConnContext, FrameReader) {
        let peer_id = conn.peer_id;
        let addr = conn.addr;
        let outbound = conn.outbound;
        let framed = conn.framed(self.config.chain_id, self.config.version);
        let (mut writer, reader) = framed.split();

        let (tx, mut rx) = mpsc::channel::<Frame>(SEND_QUEUE_SIZE);
        let token = self.shutdown.child_token();
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);

        let write_token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = write_token.cancelled() => break,
                    frame = rx.recv() => match frame {
                        Some(frame) => {
                            if let Err(e) = writer.send(frame).await {
                                log::warn!("Write to {} failed: {}", addr, e);
                                // the reader loop cleans up
                                write_token.cancel();
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = writer.close().await;
        });

        let ctx = ConnContext {
            conn_id,
            peer_id,
            addr,
            handle: PeerHandle { addr, tx },
            outbound,
            token,
        };
        (ctx, reader)
    }

    /// Run the stream handler for an accepted connection
    pub(crate) fn serve_inbound(self: &Arc<Self>, conn: Connection) {
        log::info!("Accepted connection from {} at {}", conn.peer_id, conn.addr);
        let (ctx, reader) = self.open_channel(conn);
        self.spawn_connection(ctx, reader);
    }

    pub(crate) fn spawn_connection(self: &Arc<Self>, ctx: ConnContext, reader: FrameReader) {
        tokio::spawn(Arc::clone(self).run_connection(ctx, reader));
    }

    async fn run_connection(self: Arc<Self>, ctx: ConnContext, mut reader: FrameReader) {
        let exit = loop {
            let frame = tokio::select! {
                _ = ctx.token.cancelled() => break LoopExit::Cancelled,
                next = reader.next() => match next {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => break LoopExit::Failed(e.into()),
                    None => break LoopExit::Closed,
                },
            };

            if let Err(e) = self.handle_frame(&ctx, frame).await {
                break LoopExit::Failed(e);
            }
        };

        match exit {
            LoopExit::Cancelled => {
                log::debug!("Connection {} to {} cancelled", ctx.conn_id, ctx.addr);
            }
            LoopExit::Closed => {
                log::info!("Peer {} at {} disconnected", ctx.peer_id, ctx.addr);
            }
            LoopExit::Failed(PeerError::Frame(e)) if e.is_protocol_mismatch() => {
                log::info!("Peer {} at {} speaks another protocol: {}", ctx.peer_id, ctx.addr, e);
            }
            LoopExit::Failed(e) => {
                log::warn!("Closing connection to {} at {}: {}", ctx.peer_id, ctx.addr, e);
            }
        }

        // A replaced connection must not tear down the session that replaced it
        let owned = self.sessions.remove_if(&ctx.addr, ctx.conn_id).await;
        if owned && !self.shutdown.is_cancelled() {
            self.bye(ctx.peer_id, &[ctx.addr]).await;
        }
        ctx.token.cancel();
    }

    /// Route one validated frame to its protocol handler
    async fn handle_frame(
        self: &Arc<Self>,
        ctx: &ConnContext,
        frame: Frame,
    ) -> Result<(), PeerError> {
        log::debug!(
            "Received {} ({} bytes) from {}",
            frame.name,
            frame.payload.len(),
            ctx.addr
        );

        match frame.kind() {
            Some(MessageKind::Hello) => {
                // Frames are written in queue order and a failed write ends
                // the connection, which undoes this registration.
                ctx.handle.send(Frame::from_kind(MessageKind::Ok, OK)).await?;
                self.register_session(ctx).await;
            }
            Some(MessageKind::Ok) => {
                if frame.payload.as_ref() != OK.as_bytes() {
                    return Err(PeerError::Handshake(format!(
                        "incorrect ok payload from {}",
                        ctx.addr
                    )));
                }
                self.register_session(ctx).await;
            }
            Some(MessageKind::Bye) => {
                log::debug!("Peer {} said bye", ctx.peer_id);
            }
            Some(MessageKind::NewBlock) => {
                let block = Block::from_bytes(&frame.payload)
                    .map_err(|e| PeerError::Dispatch(format!("undecodable block: {}", e)))?;
                log::info!("New block {} from {}", block.index, ctx.peer_id);
                self.dispatcher
                    .put_message(TaggedMessage::new(ctx.peer_id, NetMessage::NewBlock(block)));
            }
            Some(MessageKind::SyncRoute) => {
                self.handle_sync_route(ctx).await?;
            }
            Some(MessageKind::SyncRouteReply) => {
                self.handle_sync_route_reply(ctx, &frame.payload).await?;
            }
            None => {
                log::warn!("Ignoring unknown message {:?} from {}", frame.name, ctx.addr);
            }
        }
        Ok(())
    }

    /// Mark a connection as an established session with a reachable peer.
    /// Returns false if another live connection keeps the address.
    pub(crate) async fn register_session(&self, ctx: &ConnContext) -> bool {
        let session = Session::connected(
            ctx.conn_id,
            ctx.peer_id,
            ctx.dialer(self.local_id),
            ctx.handle.clone(),
            ctx.token.clone(),
        );
        if !self.sessions.put(ctx.addr, session).await {
            return false;
        }
        self.peerstore
            .write()
            .await
            .add_addr(ctx.peer_id, ctx.addr, PERMANENT_ADDR_TTL);
        self.route_table.write().await.update(ctx.peer_id);
        log::info!("Session established with {} at {}", ctx.peer_id, ctx.addr);
        true
    }
}
