//! Test doubles for connections.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use super::connection::{Connection, ConnectionId, ReceiveControl, TransportKind};

/// Receive gate that records how it was driven.
#[derive(Debug, Default)]
pub struct MockGate {
    paused: AtomicBool,
    pauses: AtomicUsize,
    resumes: AtomicUsize,
}

impl MockGate {
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn pauses(&self) -> usize {
        self.pauses.load(Ordering::SeqCst)
    }

    pub fn resumes(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }
}

impl ReceiveControl for MockGate {
    fn pause_recv(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.pauses.fetch_add(1, Ordering::SeqCst);
    }

    fn resume_recv(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.resumes.fetch_add(1, Ordering::SeqCst);
    }
}

/// A pausable stream connection.
#[derive(Debug)]
pub struct MockStream {
    id: ConnectionId,
    pub gate: Arc<MockGate>,
}

impl MockStream {
    pub fn new() -> Self {
        Self {
            id: ConnectionId::new(),
            gate: Arc::new(MockGate::default()),
        }
    }
}

impl Connection for MockStream {
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

/// A connection without receive control.
#[derive(Debug)]
pub struct MockUnpausable {
    id: ConnectionId,
    kind: TransportKind,
}

impl MockUnpausable {
    pub fn datagram() -> Self {
        Self {
            id: ConnectionId::new(),
            kind: TransportKind::Datagram,
        }
    }

    pub fn other() -> Self {
        Self {
            id: ConnectionId::new(),
            kind: TransportKind::Other,
        }
    }
}

impl Connection for MockUnpausable {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }
}
