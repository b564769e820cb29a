//! Rate limiting with bounded burst catch-up.
//!
//! A [`RateLimiter`] paces callers to a target operations-per-second rate by
//! advancing a shared "scheduled nanos" cursor with a single fetch-and-add per
//! call. Callers that arrive early sleep until their scheduled instant;
//! callers that arrive late are allowed to catch up only within the burst
//! allowance, after which the cursor is clamped forward so schedule debt
//! cannot grow without bound.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::RateSpec;

/// Waits shorter than this are spun rather than slept, and sleeps leave this
/// much slack to absorb OS timer overshoot before the final spin.
const SPIN_SLACK_NANOS: u64 = 1_500_000;

/// Paces calls to a target rate. Safe to share across threads; the cursor
/// fetch-and-add is the only serialization point.
pub struct RateLimiter {
    epoch: Instant,
    /// Next unclaimed schedule slot, in nanos since `epoch`.
    cursor: AtomicU64,
    /// Ideal spacing between ops; zero disables pacing entirely.
    nanos_per_op: AtomicU64,
    /// Maximum schedule lag tolerated before the cursor is clamped forward:
    /// `nanos_per_op * (burst_ratio - 1)`.
    burst_nanos: AtomicU64,
    /// Total nanos callers have spent blocked in [`RateLimiter::block`].
    waited_nanos: AtomicU64,
}

impl RateLimiter {
    pub fn new(spec: RateSpec) -> Self {
        let limiter = Self {
            epoch: Instant::now(),
            cursor: AtomicU64::new(0),
            nanos_per_op: AtomicU64::new(0),
            burst_nanos: AtomicU64::new(0),
            waited_nanos: AtomicU64::new(0),
        };
        limiter.apply_spec(spec);
        limiter
    }

    /// A limiter that never blocks, for activities with no configured rate.
    pub fn unlimited() -> Self {
        Self::new(RateSpec::unlimited())
    }

    /// Re-targets the limiter. Takes effect on the next `block` call without
    /// resetting the cursor, so accumulated catch-up budget is preserved up
    /// to the new burst bound.
    pub fn apply_spec(&self, spec: RateSpec) {
        let (per_op, burst) = if spec.ops_per_sec > 0.0 {
            let per_op = (1e9 / spec.ops_per_sec) as u64;
            let burst = (per_op as f64 * (spec.burst_ratio - 1.0).max(0.0)) as u64;
            (per_op.max(1), burst)
        } else {
            // Non-positive rates disable pacing rather than erroring.
            (0, 0)
        };
        self.nanos_per_op.store(per_op, Ordering::Relaxed);
        self.burst_nanos.store(burst, Ordering::Relaxed);
        debug!(
            ops_per_sec = spec.ops_per_sec,
            burst_ratio = spec.burst_ratio,
            nanos_per_op = per_op,
            "rate limiter retargeted"
        );
    }

    /// Claims the next schedule slot and blocks until it arrives. Returns the
    /// nanos spent waiting (zero when at or behind schedule).
    pub fn block(&self) -> u64 {
        let per_op = self.nanos_per_op.load(Ordering::Relaxed);
        if per_op == 0 {
            return 0;
        }
        let scheduled = self.cursor.fetch_add(per_op, Ordering::Relaxed);
        let now = self.elapsed_nanos();
        if now >= scheduled {
            // The caller is at or behind schedule. Bound the accumulated
            // debt so a stalled caller cannot trigger an unbounded burst.
            let lag = now - scheduled;
            let burst = self.burst_nanos.load(Ordering::Relaxed);
            if lag > burst {
                self.cursor.fetch_max(now - burst, Ordering::Relaxed);
            }
            return 0;
        }
        let wait = scheduled - now;
        if wait > SPIN_SLACK_NANOS {
            std::thread::sleep(Duration::from_nanos(wait - SPIN_SLACK_NANOS));
        }
        while self.elapsed_nanos() < scheduled {
            std::hint::spin_loop();
        }
        self.waited_nanos.fetch_add(wait, Ordering::Relaxed);
        wait
    }

    /// Cumulative nanos spent blocked across all callers.
    pub fn total_waited_nanos(&self) -> u64 {
        self.waited_nanos.load(Ordering::Relaxed)
    }

    /// Current ideal spacing between ops; zero when pacing is disabled.
    pub fn nanos_per_op(&self) -> u64 {
        self.nanos_per_op.load(Ordering::Relaxed)
    }

    fn elapsed_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}
