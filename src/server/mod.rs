//! Host transports that drive a rate-limiting [`Protocol`].
//!
//! [`Protocol`]: crate::ratelimit::Protocol

mod tcp;
mod udp;

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use serde_json::Value;

use crate::ratelimit::Connection;

pub use tcp::{RecvGate, TcpConnection, TcpServer};
pub use udp::{UdpPeer, UdpServer};

/// Per-peer limit overrides applied when a connection is accepted.
pub type PeerLimits = HashMap<IpAddr, u64>;

/// Application logic behind the rate limiter.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one admitted message. The returned value, if any, is encoded
    /// and written back to the peer.
    async fn on_message(&self, conn: &dyn Connection, message: &[u8]) -> Option<Value>;
}

/// Replies with the message it received.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn on_message(&self, _conn: &dyn Connection, message: &[u8]) -> Option<Value> {
        Some(Value::String(String::from_utf8_lossy(message).into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::mocks::MockStream;

    #[tokio::test]
    async fn test_echo_handler() {
        let conn = MockStream::new();
        let reply = EchoHandler.on_message(&conn, b"ping").await;

        assert_eq!(reply, Some(Value::String("ping".to_string())));
    }
}
