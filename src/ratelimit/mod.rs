//! Per-connection rate limiting: statistics, the shared engine and the
//! packet-count and byte-volume policies built on it.

mod clock;
mod connection;
mod engine;
mod packet;
mod protocol;
mod scheduler;
mod stats;
mod traffic;

#[cfg(test)]
pub(crate) mod mocks;

pub use clock::{Clock, ManualClock, SystemClock};
pub use connection::{Connection, ConnectionId, ReceiveControl, TransportKind};
pub use engine::{MeteringPolicy, RateLimitEngine, RESUME_DELAY};
pub use packet::{PacketPolicy, PacketRateLimitProtocol};
pub use protocol::{coerce_payload, InputOutcome, Protocol};
pub use scheduler::{ManualScheduler, Scheduler, Task, TokioScheduler};
pub use stats::ConnectionStats;
pub use traffic::{TrafficPolicy, TrafficRateLimitProtocol};
