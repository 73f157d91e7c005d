//! UDP host: every datagram is handled as its own short-lived connection.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{error, info, trace};

use super::{MessageHandler, PeerLimits};
use crate::error::Result;
use crate::ratelimit::{Connection, ConnectionId, InputOutcome, Protocol, TransportKind};

const MAX_DATAGRAM_BYTES: usize = 65_535;

/// The sender of one datagram. Has no receive control.
#[derive(Debug)]
pub struct UdpPeer {
    id: ConnectionId,
    peer: SocketAddr,
}

impl UdpPeer {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            id: ConnectionId::new(),
            peer,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Connection for UdpPeer {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }
}

/// UDP server that meters every datagram through a [`Protocol`].
pub struct UdpServer<P: Protocol, H: MessageHandler> {
    socket: UdpSocket,
    protocol: Arc<P>,
    handler: Arc<H>,
    peer_limits: PeerLimits,
}

impl<P: Protocol, H: MessageHandler> UdpServer<P, H> {
    pub async fn bind(addr: SocketAddr, protocol: Arc<P>, handler: Arc<H>) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket,
            protocol,
            handler,
            peer_limits: PeerLimits::new(),
        })
    }

    pub fn with_peer_limits(mut self, peer_limits: PeerLimits) -> Self {
        self.peer_limits = peer_limits;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Receive datagrams until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let addr = self.local_addr()?;
        info!(addr = %addr, policy = self.protocol.name(), "Starting UDP server");

        let mut buffer = vec![0u8; MAX_DATAGRAM_BYTES];
        tokio::pin!(signal);
        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("UDP server shutting down");
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buffer) => {
                    match received {
                        Ok((len, peer)) => {
                            if let Err(e) = self.handle_datagram(&buffer[..len], peer).await {
                                error!(peer = %peer, error = %e, "Failed to handle datagram");
                            }
                        }
                        Err(e) => error!(error = %e, "Failed to receive datagram"),
                    }
                }
            }
        }
    }

    async fn handle_datagram(&self, datagram: &[u8], peer: SocketAddr) -> Result<()> {
        let conn = UdpPeer::new(peer);
        let result = self.dispatch(datagram, &conn).await;
        self.protocol.release(conn.id());
        result
    }

    async fn dispatch(&self, datagram: &[u8], conn: &UdpPeer) -> Result<()> {
        if let Some(limit) = self.peer_limits.get(&conn.peer().ip()) {
            self.protocol.set_connection_limit(conn, *limit)?;
        }

        let len = match self.protocol.input(datagram, conn) {
            InputOutcome::Message(len) => len,
            outcome => {
                trace!(peer = %conn.peer(), bytes = datagram.len(), ?outcome, "Datagram not admitted");
                return Ok(());
            }
        };

        let message = self.protocol.decode(&datagram[..len], conn);
        if let Some(reply) = self.handler.on_message(conn, message).await {
            let encoded = self.protocol.encode(&reply, conn)?;
            if !encoded.is_empty() {
                self.socket.send_to(encoded.as_bytes(), conn.peer()).await?;
            }
        }
        Ok(())
    }
}
