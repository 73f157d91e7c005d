//! TCP host: one task per connection, reads gated by the rate limiter.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{MessageHandler, PeerLimits};
use crate::error::Result;
use crate::ratelimit::{Connection, ConnectionId, InputOutcome, Protocol, ReceiveControl, TransportKind};

const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// Open/closed switch for a connection's reads.
#[derive(Debug)]
pub struct RecvGate {
    open: watch::Sender<bool>,
}

impl RecvGate {
    pub fn new() -> Self {
        let (open, _) = watch::channel(true);
        Self { open }
    }

    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    /// Wait until reads are allowed.
    pub async fn opened(&self) {
        let mut rx = self.open.subscribe();
        // The sender lives in `self`, so this cannot fail.
        let _ = rx.wait_for(|open| *open).await;
    }
}

impl Default for RecvGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveControl for RecvGate {
    fn pause_recv(&self) {
        self.open.send_replace(false);
    }

    fn resume_recv(&self) {
        self.open.send_replace(true);
    }
}

/// An accepted TCP connection.
#[derive(Debug)]
pub struct TcpConnection {
    id: ConnectionId,
    peer: SocketAddr,
    gate: Arc<RecvGate>,
}

impl TcpConnection {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            id: ConnectionId::new(),
            peer,
            gate: Arc::new(RecvGate::new()),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn gate(&self) -> &RecvGate {
        &self.gate
    }
}

impl Connection for TcpConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn receive_control(&self) -> Option<Arc<dyn ReceiveControl>> {
        Some(self.gate.clone() as Arc<dyn ReceiveControl>)
    }
}

/// TCP server that meters every connection through a [`Protocol`].
pub struct TcpServer<P: Protocol, H: MessageHandler> {
    listener: TcpListener,
    protocol: Arc<P>,
    handler: Arc<H>,
    peer_limits: Arc<PeerLimits>,
    max_frame_bytes: usize,
}

impl<P: Protocol, H: MessageHandler> TcpServer<P, H> {
    /// Bind a listener on `addr`.
    pub async fn bind(addr: SocketAddr, protocol: Arc<P>, handler: Arc<H>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            protocol,
            handler,
            peer_limits: Arc::new(PeerLimits::new()),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        })
    }

    pub fn with_peer_limits(mut self, peer_limits: PeerLimits) -> Self {
        self.peer_limits = Arc::new(peer_limits);
        self
    }

    /// Cap the number of bytes read per event.
    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes.max(1);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the process ends.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Accept connections until `signal` resolves.
    ///
    /// Connections already accepted keep running on their own tasks.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let addr = self.local_addr()?;
        info!(addr = %addr, policy = self.protocol.name(), "Starting TCP server");

        tokio::pin!(signal);
        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("TCP server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!(error = %e, "Failed to accept TCP connection");
                            continue;
                        }
                    };

                    let protocol = self.protocol.clone();
                    let handler = self.handler.clone();
                    let limit = self.peer_limits.get(&peer.ip()).copied();
                    let max_frame_bytes = self.max_frame_bytes;

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, protocol, handler, limit, max_frame_bytes).await {
                            warn!(peer = %peer, error = %e, "Connection ended with error");
                        }
                    });
                }
            }
        }
    }
}

async fn handle_connection<P: Protocol, H: MessageHandler>(
    stream: TcpStream,
    peer: SocketAddr,
    protocol: Arc<P>,
    handler: Arc<H>,
    limit: Option<u64>,
    max_frame_bytes: usize,
) -> Result<()> {
    let conn = TcpConnection::new(peer);
    debug!(connection = %conn.id(), peer = %peer, "Accepted connection");

    let result = match limit {
        Some(limit) => protocol.set_connection_limit(&conn, limit),
        None => Ok(()),
    };
    let result = match result {
        Ok(()) => pump(stream, &conn, protocol.as_ref(), handler.as_ref(), max_frame_bytes).await,
        Err(e) => Err(e),
    };

    protocol.release(conn.id());
    debug!(connection = %conn.id(), peer = %peer, "Connection closed");
    result
}

/// Read, meter, dispatch and reply until the peer hangs up.
async fn pump<P: Protocol, H: MessageHandler>(
    mut stream: TcpStream,
    conn: &TcpConnection,
    protocol: &P,
    handler: &H,
    max_frame_bytes: usize,
) -> Result<()> {
    let mut buffer: Vec<u8> = Vec::with_capacity(max_frame_bytes);
    let mut chunk = vec![0u8; max_frame_bytes];

    loop {
        conn.gate().opened().await;

        if !buffer.is_empty() {
            match protocol.input(&buffer, conn) {
                InputOutcome::Message(len) => {
                    let message: Vec<u8> = buffer.drain(..len).collect();
                    let decoded = protocol.decode(&message, conn);
                    if let Some(reply) = handler.on_message(conn, decoded).await {
                        let encoded = protocol.encode(&reply, conn)?;
                        if !encoded.is_empty() {
                            stream.write_all(encoded.as_bytes()).await?;
                        }
                    }
                    continue;
                }
                // Paused: the gate holds the next iteration back.
                InputOutcome::Pending => continue,
                InputOutcome::Dropped => buffer.clear(),
                InputOutcome::Close => {
                    warn!(connection = %conn.id(), peer = %conn.peer(), "Protocol requested close");
                    return Ok(());
                }
            }
        }

        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            return Ok(());
        }
        buffer.extend_from_slice(&chunk[..read]);
    }
}
