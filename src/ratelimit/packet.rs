//! Packet-count policy: one unit per inbound or outbound message.

use std::sync::Arc;

use serde_json::Value;
use tracing::{trace, warn};

use super::clock::Clock;
use super::connection::{Connection, ConnectionId, TransportKind};
use super::engine::{MeteringPolicy, RateLimitEngine};
use super::protocol::{coerce_payload, InputOutcome, Protocol};
use super::scheduler::Scheduler;
use crate::error::Result;

/// Counts messages; the limit is in packets per second.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketPolicy;

impl MeteringPolicy for PacketPolicy {
    const NAME: &'static str = "packet";
    const DEFAULT_LIMIT: u64 = 100;
}

/// Rate-limiting protocol that meters packets per second.
#[derive(Debug)]
pub struct PacketRateLimitProtocol {
    engine: RateLimitEngine<PacketPolicy>,
}

impl PacketRateLimitProtocol {
    pub fn new(clock: Arc<dyn Clock>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            engine: RateLimitEngine::new(clock, scheduler),
        }
    }

    /// Protocol on the wall clock and the current tokio runtime.
    pub fn system() -> Self {
        Self {
            engine: RateLimitEngine::system(),
        }
    }

    pub fn engine(&self) -> &RateLimitEngine<PacketPolicy> {
        &self.engine
    }
}

impl Protocol for PacketRateLimitProtocol {
    fn name(&self) -> &'static str {
        PacketPolicy::NAME
    }

    fn decode<'a>(&self, buffer: &'a [u8], conn: &dyn Connection) -> &'a [u8] {
        self.engine.decode(buffer, conn)
    }

    fn input(&self, buffer: &[u8], conn: &dyn Connection) -> InputOutcome {
        let admitted = self.engine.meter(conn, |stats| {
            if stats.is_packet_limit_exceeded() {
                (stats, false)
            } else {
                (stats.with_packet(), true)
            }
        });

        if admitted {
            trace!(connection = %conn.id(), bytes = buffer.len(), "Packet admitted");
            return InputOutcome::Message(buffer.len());
        }

        if conn.receive_control().is_some() {
            self.engine.pause(conn);
            return InputOutcome::Pending;
        }

        match conn.kind() {
            TransportKind::Datagram => {
                trace!(connection = %conn.id(), bytes = buffer.len(), "Packet dropped");
                InputOutcome::Dropped
            }
            kind => {
                warn!(connection = %conn.id(), ?kind, "Packet limit exceeded, requesting close");
                InputOutcome::Close
            }
        }
    }

    fn encode(&self, data: &Value, conn: &dyn Connection) -> Result<String> {
        let text = coerce_payload(data)?;
        let pausable = conn.receive_control().is_some();

        let exceeded = self.engine.meter(conn, |stats| {
            let exceeded = stats.is_packet_limit_exceeded();
            if exceeded && !pausable {
                (stats, true)
            } else {
                (stats.with_packet(), exceeded)
            }
        });

        if !exceeded {
            return Ok(text);
        }
        if pausable {
            // Outbound data is still sent; only receiving is throttled.
            self.engine.pause(conn);
            return Ok(text);
        }

        trace!(connection = %conn.id(), bytes = text.len(), "Outbound packet dropped");
        Ok(String::new())
    }

    fn set_connection_limit(&self, conn: &dyn Connection, limit: u64) -> Result<()> {
        self.engine.set_connection_limit(conn, limit)
    }

    fn release(&self, id: ConnectionId) {
        self.engine.release(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnLimitError;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::engine::RESUME_DELAY;
    use crate::ratelimit::mocks::{MockStream, MockUnpausable};
    use crate::ratelimit::scheduler::ManualScheduler;
    use serde_json::json;

    const START: u64 = 1_704_067_200;

    fn create_protocol(default_limit: u64) -> (PacketRateLimitProtocol, ManualClock, Arc<ManualScheduler>) {
        let clock = ManualClock::new(START);
        let scheduler = Arc::new(ManualScheduler::new());
        let protocol = PacketRateLimitProtocol::new(Arc::new(clock.clone()), scheduler.clone());
        protocol.engine().set_default_limit(default_limit).unwrap();
        (protocol, clock, scheduler)
    }

    #[test]
    fn test_default_limit() {
        let (protocol, _, _) = create_protocol(1);
        let fresh = PacketRateLimitProtocol::new(
            Arc::new(ManualClock::new(START)),
            Arc::new(ManualScheduler::new()),
        );

        assert_eq!(fresh.engine().default_limit(), 100);
        assert_eq!(protocol.engine().default_limit(), 1);
    }

    #[test]
    fn test_single_packet_pauses_on_second() {
        let (protocol, _, scheduler) = create_protocol(1);
        let conn = MockStream::new();

        let first = protocol.input(b"packet1", &conn);
        assert_eq!(first, InputOutcome::Message(7));
        assert_eq!(first.consumed(), "packet1".len() as i64);
        assert!(!protocol.engine().is_paused(&conn));

        let second = protocol.input(b"packet2", &conn);
        assert_eq!(second.consumed(), 0);
        assert!(protocol.engine().is_paused(&conn));
        assert!(conn.gate.is_paused());

        scheduler.advance(RESUME_DELAY);
        assert!(!protocol.engine().is_paused(&conn));
        assert!(!conn.gate.is_paused());
    }

    #[test]
    fn test_rejected_packet_is_not_recorded() {
        let (protocol, _, _) = create_protocol(3);
        let conn = MockStream::new();

        for _ in 0..5 {
            protocol.input(b"x", &conn);
        }

        assert_eq!(protocol.engine().stats(&conn).packets(), 3);
    }

    #[test]
    fn test_connection_limit_overrides_default() {
        let (protocol, _, _) = create_protocol(10);
        let limited = MockStream::new();
        let regular = MockStream::new();

        protocol.set_connection_limit(&limited, 2).unwrap();

        assert_eq!(protocol.input(b"a", &limited), InputOutcome::Message(1));
        assert_eq!(protocol.input(b"b", &limited), InputOutcome::Message(1));
        assert_eq!(protocol.input(b"c", &limited), InputOutcome::Pending);
        assert!(protocol.engine().is_paused(&limited));

        for i in 0..10 {
            assert_eq!(
                protocol.input(b"a", &regular),
                InputOutcome::Message(1),
                "packet {} should be admitted",
                i + 1
            );
        }
        assert!(!protocol.engine().is_paused(&regular));
        assert_eq!(protocol.input(b"a", &regular), InputOutcome::Pending);
        assert!(protocol.engine().is_paused(&regular));
    }

    #[test]
    fn test_datagram_packets_dropped() {
        let (protocol, _, scheduler) = create_protocol(1);
        let conn = MockUnpausable::datagram();

        assert_eq!(protocol.input(b"one", &conn), InputOutcome::Message(3));
        assert_eq!(protocol.input(b"two", &conn), InputOutcome::Dropped);
        assert!(!protocol.engine().is_paused(&conn));
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_unsupported_transport_requests_close() {
        let (protocol, _, _) = create_protocol(1);
        let conn = MockUnpausable::other();

        assert_eq!(protocol.input(b"one", &conn), InputOutcome::Message(3));
        let outcome = protocol.input(b"two", &conn);
        assert_eq!(outcome, InputOutcome::Close);
        assert_eq!(outcome.consumed(), -1);
    }

    #[test]
    fn test_next_window_admits_again() {
        let (protocol, clock, _) = create_protocol(1);
        let conn = MockStream::new();

        protocol.input(b"a", &conn);
        assert_eq!(protocol.input(b"b", &conn), InputOutcome::Pending);

        clock.advance(1);
        assert_eq!(protocol.input(b"b", &conn), InputOutcome::Message(1));
        assert!(!protocol.engine().is_paused(&conn));
    }

    #[test]
    fn test_encode_scalar_records_packet() {
        let (protocol, _, _) = create_protocol(10);
        let conn = MockStream::new();

        assert_eq!(protocol.encode(&json!(123456), &conn).unwrap(), "123456");
        assert_eq!(protocol.engine().stats(&conn).packets(), 1);
    }

    #[test]
    fn test_encode_over_limit_on_stream_still_sends() {
        let (protocol, _, _) = create_protocol(1);
        let conn = MockStream::new();

        assert_eq!(protocol.encode(&json!("first"), &conn).unwrap(), "first");
        assert_eq!(protocol.encode(&json!("second"), &conn).unwrap(), "second");

        assert!(protocol.engine().is_paused(&conn));
        assert_eq!(protocol.engine().stats(&conn).packets(), 2);
    }

    #[test]
    fn test_encode_over_limit_on_datagram_drops() {
        let (protocol, _, _) = create_protocol(1);
        let conn = MockUnpausable::datagram();

        assert_eq!(protocol.encode(&json!("first"), &conn).unwrap(), "first");
        assert_eq!(protocol.encode(&json!("second"), &conn).unwrap(), "");
        assert_eq!(protocol.engine().stats(&conn).packets(), 1);
    }

    #[test]
    fn test_encode_rejects_collections() {
        let (protocol, _, _) = create_protocol(10);
        let conn = MockStream::new();

        let result = protocol.encode(&json!(["a", "b"]), &conn);
        assert!(matches!(result, Err(ConnLimitError::InvalidPayload(_))));
    }

    #[test]
    fn test_release_resets_bookkeeping() {
        let (protocol, _, _) = create_protocol(1);
        let conn = MockStream::new();

        protocol.input(b"a", &conn);
        protocol.release(conn.id());

        assert_eq!(protocol.engine().tracked_connections(), 0);
        assert_eq!(protocol.input(b"a", &conn), InputOutcome::Message(1));
    }

    #[test]
    fn test_decode_passthrough() {
        let (protocol, _, _) = create_protocol(1);
        let conn = MockStream::new();

        assert_eq!(protocol.decode(b"raw bytes", &conn), b"raw bytes");
    }
}
