//! Byte-volume policy: units are the byte length of each buffer.

use std::sync::Arc;

use serde_json::Value;
use tracing::trace;

use super::clock::Clock;
use super::connection::{Connection, ConnectionId};
use super::engine::{MeteringPolicy, RateLimitEngine};
use super::protocol::{coerce_payload, InputOutcome, Protocol};
use super::scheduler::Scheduler;
use crate::error::Result;

/// Counts bytes; the limit is in bytes per second.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrafficPolicy;

impl MeteringPolicy for TrafficPolicy {
    const NAME: &'static str = "traffic";
    const DEFAULT_LIMIT: u64 = 1024 * 1024;
}

/// Rate-limiting protocol that meters bytes per second.
#[derive(Debug)]
pub struct TrafficRateLimitProtocol {
    engine: RateLimitEngine<TrafficPolicy>,
}

impl TrafficRateLimitProtocol {
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

    pub fn engine(&self) -> &RateLimitEngine<TrafficPolicy> {
        &self.engine
    }
}

impl Protocol for TrafficRateLimitProtocol {
    fn name(&self) -> &'static str {
        TrafficPolicy::NAME
    }

    fn decode<'a>(&self, buffer: &'a [u8], conn: &dyn Connection) -> &'a [u8] {
        self.engine.decode(buffer, conn)
    }

    fn input(&self, buffer: &[u8], conn: &dyn Connection) -> InputOutcome {
        let len = buffer.len() as u64;
        let admitted = self.engine.meter(conn, |stats| {
            if stats.is_traffic_limit_exceeded(len) {
                (stats, false)
            } else {
                (stats.with_traffic(len), true)
            }
        });

        if admitted {
            trace!(connection = %conn.id(), bytes = len, "Traffic admitted");
            return InputOutcome::Message(buffer.len());
        }

        if conn.receive_control().is_some() {
            self.engine.pause(conn);
            return InputOutcome::Pending;
        }

        trace!(connection = %conn.id(), bytes = len, "Traffic dropped");
        InputOutcome::Dropped
    }

    fn encode(&self, data: &Value, conn: &dyn Connection) -> Result<String> {
        let text = coerce_payload(data)?;
        let len = text.len() as u64;
        let pausable = conn.receive_control().is_some();

        let exceeded = self.engine.meter(conn, |stats| {
            let exceeded = stats.is_traffic_limit_exceeded(len);
            if exceeded && !pausable {
                (stats, true)
            } else {
                (stats.with_traffic(len), exceeded)
            }
        });

        if !exceeded {
            return Ok(text);
        }
        if pausable {
            self.engine.pause(conn);
            return Ok(text);
        }

        trace!(connection = %conn.id(), bytes = len, "Outbound traffic dropped");
        Ok(String::new())
    }

    fn set_connection_limit(&self, conn: &dyn Connection, limit: u64) -> Result<()> {
        self.engine.set_connection_limit(conn, limit)
    }

    fn release(&self, id: ConnectionId) {
        self.engine.release(id);
    }
}
