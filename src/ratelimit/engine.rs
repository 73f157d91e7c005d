//! Core rate-limit engine shared by every metering policy.
//!
//! The engine owns two tables keyed by [`ConnectionId`]: the current-window
//! statistics and the pause state of each connection's receive side. Windows
//! roll over lazily, whenever a connection's stats are next read. The only
//! timer is the one-shot forced resume scheduled when a connection is paused.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::connection::{Connection, ConnectionId, ReceiveControl};
use super::scheduler::{Scheduler, TokioScheduler};
use super::stats::ConnectionStats;
use crate::error::{ConnLimitError, Result};

/// How long a paused connection waits before its receive side is forced open.
pub const RESUME_DELAY: Duration = Duration::from_secs(1);

/// A metering strategy: what unit is counted and what limit applies by default.
pub trait MeteringPolicy: Send + Sync + 'static {
    /// Short name used in logs
    const NAME: &'static str;
    /// Default threshold, in the policy's unit per second
    const DEFAULT_LIMIT: u64;

    /// Zero-state factory for a connection first seen at `now`.
    fn create_stats(limit: u64, now: u64) -> ConnectionStats {
        ConnectionStats::fresh(limit, now)
    }
}

struct PauseEntry {
    paused: bool,
    control: Weak<dyn ReceiveControl>,
}

struct EngineState {
    default_limit: AtomicU64,
    stats: DashMap<ConnectionId, ConnectionStats>,
    paused: DashMap<ConnectionId, PauseEntry>,
}

impl EngineState {
    /// Resume `id` if it is paused. Returns whether the receive side was reopened.
    fn resume(&self, id: ConnectionId) -> bool {
        let Some(mut entry) = self.paused.get_mut(&id) else {
            return false;
        };
        if !entry.paused {
            return false;
        }

        let control = entry.control.upgrade();
        match control {
            Some(control) => {
                control.resume_recv();
                entry.paused = false;
                true
            }
            None => {
                // The connection went away without a release call.
                drop(entry);
                self.paused.remove(&id);
                self.stats.remove(&id);
                debug!(connection = %id, "Dropped bookkeeping for vanished connection");
                false
            }
        }
    }
}

/// Per-connection fixed-window rate limiter.
///
/// One engine is created per listening protocol and shared by all of its
/// connections. The type is thread-safe; the read-check-write sequence on a
/// connection's stats is performed under that connection's table entry lock.
pub struct RateLimitEngine<P: MeteringPolicy> {
    state: Arc<EngineState>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    _policy: PhantomData<fn() -> P>,
}

impl<P: MeteringPolicy> RateLimitEngine<P> {
    /// Create an engine using the policy's default limit.
    pub fn new(clock: Arc<dyn Clock>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            state: Arc::new(EngineState {
                default_limit: AtomicU64::new(P::DEFAULT_LIMIT),
                stats: DashMap::new(),
                paused: DashMap::new(),
            }),
            clock,
            scheduler,
            _policy: PhantomData,
        }
    }

    /// Create an engine on the wall clock and the current tokio runtime.
    pub fn system() -> Self {
        Self::new(
            Arc::new(SystemClock::new()),
            Arc::new(TokioScheduler::current()),
        )
    }

    /// Set the threshold used for connections first seen from now on.
    pub fn set_default_limit(&self, limit: u64) -> Result<()> {
        ensure_positive(limit)?;
        self.state.default_limit.store(limit, Ordering::SeqCst);
        debug!(policy = P::NAME, limit, "Default limit updated");
        Ok(())
    }

    pub fn default_limit(&self) -> u64 {
        self.state.default_limit.load(Ordering::SeqCst)
    }

    /// Override the threshold for one connection.
    ///
    /// Accumulated counters and the window start are kept.
    pub fn set_connection_limit(&self, conn: &dyn Connection, limit: u64) -> Result<()> {
        ensure_positive(limit)?;
        let now = self.clock.now_secs();

        self.state
            .stats
            .entry(conn.id())
            .and_modify(|stats| *stats = stats.with_limit(limit))
            .or_insert_with(|| P::create_stats(limit, now));

        debug!(
            connection = %conn.id(),
            policy = P::NAME,
            limit,
            "Connection limit set"
        );
        Ok(())
    }

    /// Current-window stats for a connection, created on first observation.
    pub fn stats(&self, conn: &dyn Connection) -> ConnectionStats {
        self.meter(conn, |stats| (stats, stats))
    }

    /// Run `f` against the connection's current-window stats and store the
    /// stats it returns.
    ///
    /// Creation, rollover, `f` and the write-back happen under the entry
    /// lock, so concurrent calls on one connection cannot lose updates.
    pub fn meter<R>(
        &self,
        conn: &dyn Connection,
        f: impl FnOnce(ConnectionStats) -> (ConnectionStats, R),
    ) -> R {
        let id = conn.id();
        let now = self.clock.now_secs();

        let (result, rolled_over) = {
            let mut entry = self.state.stats.entry(id).or_insert_with(|| {
                let limit = self.default_limit();
                debug!(connection = %id, policy = P::NAME, limit, "Tracking new connection");
                P::create_stats(limit, now)
            });

            let rolled_over = entry.is_expired(now);
            if rolled_over {
                trace!(
                    connection = %id,
                    previous_window = entry.window_start(),
                    window = now,
                    "Window rolled over"
                );
                let fresh = entry.reset(now);
                *entry = fresh;
            }

            let (next, result) = f(*entry);
            *entry = next;
            (result, rolled_over)
        };

        if rolled_over && self.is_paused(conn) {
            self.resume(conn);
        }

        result
    }

    /// Whether the connection's receive side is currently suspended.
    pub fn is_paused(&self, conn: &dyn Connection) -> bool {
        self.state
            .paused
            .get(&conn.id())
            .map(|entry| entry.paused)
            .unwrap_or(false)
    }

    /// Suspend the connection's receive side and schedule a forced resume.
    ///
    /// No-op for connections without receive control and for connections
    /// that are already paused.
    pub fn pause(&self, conn: &dyn Connection) {
        let Some(control) = conn.receive_control() else {
            return;
        };
        let id = conn.id();

        {
            let mut entry = self.state.paused.entry(id).or_insert_with(|| PauseEntry {
                paused: false,
                control: Arc::downgrade(&control),
            });
            if entry.paused {
                trace!(connection = %id, "Connection already paused");
                return;
            }
            control.pause_recv();
            entry.paused = true;
            entry.control = Arc::downgrade(&control);
        }

        debug!(
            connection = %id,
            policy = P::NAME,
            resume_in_ms = RESUME_DELAY.as_millis() as u64,
            "Paused connection receive"
        );

        let state = Arc::downgrade(&self.state);
        self.scheduler.schedule_once(
            RESUME_DELAY,
            Box::new(move || {
                if let Some(state) = state.upgrade() {
                    if state.resume(id) {
                        debug!(connection = %id, "Resumed connection receive on timer");
                    }
                }
            }),
        );
    }

    /// Reopen the connection's receive side if it is paused.
    pub fn resume(&self, conn: &dyn Connection) {
        if conn.receive_control().is_none() {
            return;
        }
        if self.state.resume(conn.id()) {
            debug!(connection = %conn.id(), policy = P::NAME, "Resumed connection receive");
        }
    }

    /// Identity framing: the whole buffer is handed through unchanged.
    pub fn decode<'a>(&self, buffer: &'a [u8], _conn: &dyn Connection) -> &'a [u8] {
        buffer
    }

    /// Forget a connection. Called from the transport's close hook.
    ///
    /// Returns whether the connection was tracked. A pending resume timer for
    /// it becomes a no-op.
    pub fn release(&self, id: ConnectionId) -> bool {
        let had_stats = self.state.stats.remove(&id).is_some();
        let had_pause = self.state.paused.remove(&id).is_some();
        if had_stats || had_pause {
            trace!(connection = %id, policy = P::NAME, "Released connection");
        }
        had_stats || had_pause
    }

    /// Number of connections with stats entries.
    pub fn tracked_connections(&self) -> usize {
        self.state.stats.len()
    }
}

impl<P: MeteringPolicy> std::fmt::Debug for RateLimitEngine<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitEngine")
            .field("policy", &P::NAME)
            .field("default_limit", &self.default_limit())
            .field("tracked_connections", &self.tracked_connections())
            .finish()
    }
}

fn ensure_positive(limit: u64) -> Result<()> {
    if limit == 0 {
        return Err(ConnLimitError::InvalidLimit(limit));
    }
    Ok(())
}
