//! One-shot delayed callbacks.
//!
//! The engine uses a single timer: the forced resume scheduled when a
//! connection is paused. Callbacks fire once, never repeat, and cannot be
//! cancelled.

use std::fmt::Debug;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::trace;

/// A boxed callback run by a [`Scheduler`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fires callbacks once after a delay.
pub trait Scheduler: Send + Sync + Debug {
    /// Run `task` once after `delay`.
    fn schedule_once(&self, delay: Duration, task: Task);
}

/// Scheduler that spawns a sleeping task on a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Bind to the runtime the caller is running on.
    ///
    /// Panics if called outside a tokio runtime.
    pub fn current() -> Self {
        Self {
            handle: Handle::current(),
        }
    }

    pub fn with_handle(handle: Handle) -> Self {
        Self { handle }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_once(&self, delay: Duration, task: Task) {
        trace!(delay_ms = delay.as_millis() as u64, "Scheduling one-shot task");
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
    }
}

struct PendingTask {
    due: Duration,
    task: Task,
}

/// Scheduler driven by explicit calls to [`ManualScheduler::advance`].
#[derive(Default)]
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

#[derive(Default)]
struct ManualState {
    elapsed: Duration,
    pending: Vec<PendingTask>,
}

impl std::fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ManualScheduler")
            .field("elapsed", &state.elapsed)
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of callbacks that have not fired yet.
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Move time forward and fire every callback that became due.
    ///
    /// Returns how many callbacks fired.
    pub fn advance(&self, by: Duration) -> usize {
        let due = {
            let mut state = self.state.lock();
            state.elapsed += by;
            let now = state.elapsed;
            let (due, waiting): (Vec<_>, Vec<_>) =
                state.pending.drain(..).partition(|p| p.due <= now);
            state.pending = waiting;
            due
        };

        // Run outside the lock so callbacks may schedule again.
        let fired = due.len();
        for pending in due {
            (pending.task)();
        }
        fired
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_once(&self, delay: Duration, task: Task) {
        let mut state = self.state.lock();
        let due = state.elapsed + delay;
        state.pending.push(PendingTask { due, task });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_manual_scheduler_fires_when_due() {
        let scheduler = ManualScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        scheduler.schedule_once(
            Duration::from_secs(1),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert_eq!(scheduler.pending(), 1);
        assert_eq!(scheduler.advance(Duration::from_millis(999)), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        assert_eq!(scheduler.advance(Duration::from_millis(1)), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // One-shot: nothing left to fire.
        assert_eq!(scheduler.advance(Duration::from_secs(10)), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tokio_scheduler_fires_once() {
        let scheduler = TokioScheduler::current();
        let (tx, rx) = tokio::sync::oneshot::channel();

        scheduler.schedule_once(
            Duration::from_millis(10),
            Box::new(move || {
                let _ = tx.send(());
            }),
        );

        tokio_test::assert_ok!(rx.await);
    }
}
