//! Remove lock
//!
//! A `QuiesceBarrier` counts the operations in flight on a device node and
//! lets the removal path wait for all of them before the node is torn down.
//! The counter starts at one: the creator's reservation, released by the
//! first drain. Every successful [`QuiesceBarrier::acquire`] hands out a
//! [`QuiesceGuard`] that releases on drop, so the count stays balanced on
//! every exit path, including continuations that are dropped without
//! running.
//!
//! ```
//! use driver::quiesce::{QuiesceBarrier, BarrierState};
//!
//! let barrier = QuiesceBarrier::new();
//! let guard = barrier.acquire().unwrap();
//! guard.begin_drain_and_wait();
//! assert_eq!(barrier.state(), BarrierState::Drained);
//! assert!(barrier.acquire().is_err());
//! ```

use crate::event::Event;
use common::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tracing::{error, trace};

/// Observable phase of a barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierState {
    Active,
    Draining,
    Drained,
}

struct Inner {
    usage: AtomicI64,
    draining: AtomicBool,
    drained: Event<()>,
}

#[derive(Clone)]
pub struct QuiesceBarrier {
    inner: Arc<Inner>,
}

impl Default for QuiesceBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for QuiesceBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuiesceBarrier")
            .field("usage", &self.inner.usage.load(Ordering::SeqCst))
            .field("state", &self.state())
            .finish()
    }
}

impl QuiesceBarrier {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                usage: AtomicI64::new(1),
                draining: AtomicBool::new(false),
                drained: Event::new(),
            }),
        }
    }

    /// Enter the barrier
    ///
    /// Fails with [`Error::Draining`] once removal has begun; the counter is
    /// rolled back before returning and the caller must not touch node state.
    pub fn acquire(&self) -> Result<QuiesceGuard> {
        self.inner.usage.fetch_add(1, Ordering::SeqCst);

        if self.inner.draining.load(Ordering::SeqCst) {
            self.release();
            return Err(Error::Draining);
        }

        Ok(QuiesceGuard {
            barrier: self.clone(),
        })
    }

    fn release(&self) {
        let previous = self.inner.usage.fetch_sub(1, Ordering::SeqCst);
        trace!("quiesce release, {} left", previous - 1);

        if previous == 1 {
            self.inner.drained.set(());
        } else if previous < 1 {
            error!("quiesce barrier released more often than acquired");
        }
    }

    /// Operations currently holding the barrier, including the creator's
    /// reservation while it is still held
    pub fn in_flight(&self) -> i64 {
        self.inner.usage.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> BarrierState {
        if self.inner.drained.is_set() {
            BarrierState::Drained
        } else if self.inner.draining.load(Ordering::SeqCst) {
            BarrierState::Draining
        } else {
            BarrierState::Active
        }
    }
}

/// Proof of a successful acquire; releases the barrier when dropped
#[must_use = "dropping the guard releases the barrier immediately"]
pub struct QuiesceGuard {
    barrier: QuiesceBarrier,
}

impl std::fmt::Debug for QuiesceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("QuiesceGuard").field(&self.barrier).finish()
    }
}

impl QuiesceGuard {
    /// Close the barrier and block until every other holder has released
    ///
    /// Consumes the caller's own guard and the creator's reservation. A
    /// second drainer only gives back its own guard before waiting.
    pub fn begin_drain_and_wait(self) {
        let barrier = self.barrier.clone();
        let first = !barrier.inner.draining.swap(true, Ordering::SeqCst);

        drop(self);
        if first {
            barrier.release();
        }

        barrier.inner.drained.wait();
    }
}

impl Drop for QuiesceGuard {
    fn drop(&mut self) {
        self.barrier.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_barrier_is_active_with_reservation() {
        let barrier = QuiesceBarrier::new();
        assert_eq!(barrier.in_flight(), 1);
        assert_eq!(barrier.state(), BarrierState::Active);
    }

    #[test]
    fn test_guard_drop_releases() {
        let barrier = QuiesceBarrier::new();
        let a = barrier.acquire().unwrap();
        let b = barrier.acquire().unwrap();
        assert_eq!(barrier.in_flight(), 3);
        drop(a);
        drop(b);
        assert_eq!(barrier.in_flight(), 1);
    }

    #[test]
    fn test_acquire_after_drain_rolls_back() {
        let barrier = QuiesceBarrier::new();
        barrier.acquire().unwrap().begin_drain_and_wait();

        for _ in 0..3 {
            assert!(matches!(barrier.acquire(), Err(Error::Draining)));
        }
        assert_eq!(barrier.in_flight(), 0);
        assert_eq!(barrier.state(), BarrierState::Drained);
    }

    #[test]
    fn test_drain_waits_for_outstanding_guard() {
        let barrier = QuiesceBarrier::new();
        let outstanding = barrier.acquire().unwrap();
        let remove = barrier.acquire().unwrap();

        let drainer = std::thread::spawn(move || remove.begin_drain_and_wait());

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(barrier.state(), BarrierState::Draining);
        assert!(!drainer.is_finished());

        drop(outstanding);
        drainer.join().unwrap();
        assert_eq!(barrier.state(), BarrierState::Drained);
    }
}
