//! Bounded in-flight operation counting with backpressure.
//!
//! The [`PendingOpGate`] caps how many operations may be in flight at once.
//! Reservation is a lock-free compare-and-swap on an atomic counter; the
//! mutex/condvar pair exists only so callers can sleep while the gate is full
//! and be woken by releases or by a concurrent `set_max`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Bounded counter of in-flight operations.
pub struct PendingOpGate {
    count: AtomicUsize,
    max: AtomicUsize,
    lock: Mutex<()>,
    cond: Condvar,
}

impl PendingOpGate {
    pub fn new(max: usize) -> Self {
        Self {
            count: AtomicUsize::new(0),
            max: AtomicUsize::new(max),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Attempts to reserve one in-flight slot without blocking.
    pub fn try_reserve(&self) -> bool {
        let mut current = self.count.load(Ordering::Relaxed);
        loop {
            if current >= self.max.load(Ordering::Relaxed) {
                return false;
            }
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Reserves a slot, blocking up to `timeout` for one to free up.
    pub fn reserve(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_reserve() {
                return true;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            if remaining.is_zero() {
                return false;
            }
            if !self.await_below(remaining) {
                return false;
            }
        }
    }

    /// Releases one in-flight slot, waking waiters if the gate dropped below
    /// its maximum or drained to zero.
    pub fn release(&self) {
        let previous = self.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "gate released more ops than were reserved");
        let _guard = self.lock.lock().unwrap();
        self.cond.notify_all();
    }

    /// Blocks until the in-flight count is below the current maximum, or the
    /// timeout elapses. Returns whether the condition was observed.
    pub fn await_below(&self, timeout: Duration) -> bool {
        self.wait_for(timeout, || {
            self.count.load(Ordering::Acquire) < self.max.load(Ordering::Relaxed)
        })
    }

    /// Blocks until every reserved op has been released, or the timeout
    /// elapses. Used at shutdown to drain in-flight async ops.
    pub fn await_completion(&self, timeout: Duration) -> bool {
        self.wait_for(timeout, || self.count.load(Ordering::Acquire) == 0)
    }

    pub fn is_full(&self) -> bool {
        self.count.load(Ordering::Acquire) >= self.max.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::Relaxed)
    }

    /// Changes the in-flight cap. Waiters are woken immediately since the
    /// fullness condition may have changed in either direction.
    pub fn set_max(&self, max: usize) {
        self.max.store(max, Ordering::Relaxed);
        let _guard = self.lock.lock().unwrap();
        self.cond.notify_all();
    }

    fn wait_for(&self, timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock().unwrap();
        loop {
            if condition() {
                return true;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            let (next, result) = self.cond.wait_timeout(guard, remaining).unwrap();
            guard = next;
            if result.timed_out() && !condition() {
                return false;
            }
        }
    }
}
