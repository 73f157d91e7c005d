//! The connection abstraction the engine meters against.

use std::fmt::Debug;
use std::sync::Arc;

use uuid::Uuid;

/// Opaque handle identifying a connection, issued at accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Issue a new, unique connection handle.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a connection moves data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Ordered byte stream (TCP-like)
    Stream,
    /// Independent messages (UDP-like)
    Datagram,
    /// Anything else
    Other,
}

/// Capability to suspend and resume delivery of inbound data.
pub trait ReceiveControl: Send + Sync {
    fn pause_recv(&self);
    fn resume_recv(&self);
}

/// A connection as seen by the rate limiter.
pub trait Connection: Send + Sync + Debug {
    fn id(&self) -> ConnectionId;

    fn kind(&self) -> TransportKind;

    /// The receive-suspension capability, if this connection has one.
    fn receive_control(&self) -> Option<Arc<dyn ReceiveControl>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();

        assert_ne!(a, b);
        assert_eq!(a, a);
        assert_eq!(a.to_string().len(), 36);
    }
}
