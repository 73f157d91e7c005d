//! Second-resolution time sources for window accounting.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;

/// Source of the current time, truncated to whole seconds.
///
/// Windows are calendar-aligned, so only the unix second matters.
pub trait Clock: Send + Sync + Debug {
    /// Current unix timestamp in seconds.
    fn now_secs(&self) -> u64;
}

/// Wall clock backed by `chrono::Utc`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        Utc::now().timestamp().max(0) as u64
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same time value.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock reading `start`.
    pub fn new(start: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start)),
        }
    }

    /// Move the clock forward by `secs`.
    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_past_2020() {
        assert!(SystemClock::new().now_secs() > 1_577_836_800);
    }

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::new(100);
        let other = clock.clone();

        other.advance(5);
        assert_eq!(clock.now_secs(), 105);

        clock.set(42);
        assert_eq!(other.now_secs(), 42);
    }
}
