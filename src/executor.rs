//! Per-cycle execution state machine.
//!
//! A [`CycleExecutor`] runs one cycle end to end: route the cycle to its
//! dispenser, dispense the op, execute it with bounded retries, verify the
//! result, classify failures, chain any follow-on ops, and report a single
//! result code. Dispensing failures are structural and fatal to the
//! cycle; execution and verification failures go through the classifier.
//! `run_cycle` never panics and never returns an error: every terminal
//! outcome is a code.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::errors::{ErrorClassifier, ErrorResponse, OpError, CODE_DISPENSE_ERROR};
use crate::ops::{OpSequence, SynthContext};
use crate::stats::ActivityMetrics;

/// Classifier handle shared by workers; swapped wholesale on policy updates.
pub type SharedClassifier = Arc<RwLock<Arc<ErrorClassifier>>>;

/// Terminal outcome of one cycle.
#[derive(Debug, Clone, Copy)]
pub struct CycleOutcome {
    pub cycle: u64,
    /// 0 on success; otherwise the last failure's classified code.
    pub code: u8,
    /// Attempts the final op in the cycle's chain took to settle.
    pub tries: u32,
    pub elapsed: Duration,
    /// Whether this outcome must stop the whole activity.
    pub stop: bool,
}

/// One worker slot's execution engine. Each worker owns its own executor;
/// nothing here is shared except the read-mostly handles passed in.
pub struct CycleExecutor {
    sequence: Arc<OpSequence>,
    classifier: SharedClassifier,
    max_tries: Arc<AtomicU32>,
    metrics: Arc<ActivityMetrics>,
    ctx: SynthContext,
}

impl CycleExecutor {
    pub fn new(
        sequence: Arc<OpSequence>,
        classifier: SharedClassifier,
        max_tries: Arc<AtomicU32>,
        metrics: Arc<ActivityMetrics>,
        slot: usize,
    ) -> Self {
        Self {
            sequence,
            classifier,
            max_tries,
            metrics,
            ctx: SynthContext::new(slot),
        }
    }

    /// Runs one cycle to a terminal outcome.
    pub fn run_cycle(&mut self, cycle: u64) -> CycleOutcome {
        let started = Instant::now();
        let dispenser = Arc::clone(self.sequence.dispenser_for(cycle));
        let verifier = dispenser.verifier();

        let mut op = match dispenser.dispense(cycle, &mut self.ctx) {
            Ok(op) => op,
            Err(err) => {
                // Structural fault in the template or synthesis layer, not a
                // transient backend issue: fatal, never retried.
                error!(cycle, op = dispenser.name(), error = %err, "dispense failed");
                return CycleOutcome {
                    cycle,
                    code: CODE_DISPENSE_ERROR,
                    tries: 0,
                    elapsed: started.elapsed(),
                    stop: true,
                };
            }
        };

        let max_tries = self.max_tries.load(Ordering::Relaxed).max(1);
        let mut code = 0u8;
        let mut stop = false;
        let mut last_tries = 0u32;
        let mut prior: Option<Value> = None;

        loop {
            let mut tries = 0u32;
            while tries < max_tries {
                tries += 1;
                let attempt_started = Instant::now();
                let result = op.invoke(cycle, prior.as_ref()).and_then(|value| {
                    if let Some(verifier) = &verifier {
                        verifier(cycle, &value)
                            .map_err(|reason| OpError::Verification { reason })?;
                    }
                    Ok(value)
                });
                let elapsed = attempt_started.elapsed();
                match result {
                    Ok(value) => {
                        self.metrics.record_attempt(elapsed, true);
                        prior = Some(value);
                        code = 0;
                        break;
                    }
                    Err(err) => {
                        self.metrics.record_attempt(elapsed, false);
                        let detail = {
                            let classifier = self.classifier.read().unwrap();
                            classifier.classify(err.name())
                        };
                        code = detail.result_code;
                        match detail.response {
                            ErrorResponse::Stop => {
                                error!(
                                    cycle,
                                    op = dispenser.name(),
                                    error = %err,
                                    "stop-classified error"
                                );
                                stop = true;
                            }
                            ErrorResponse::Warn => {
                                warn!(cycle, op = dispenser.name(), error = %err, "op failed");
                            }
                            ErrorResponse::Count => {
                                self.metrics.increment_counter(err.name());
                            }
                            ErrorResponse::Retry => {
                                debug!(cycle, tries, error = %err, "retrying op");
                            }
                            ErrorResponse::Ignore => {}
                        }
                        if stop || !detail.retryable {
                            break;
                        }
                    }
                }
            }
            self.metrics.record_tries(tries);
            last_tries = tries;
            if stop {
                break;
            }
            match op.next_op() {
                Some(next) => op = next,
                None => break,
            }
        }

        CycleOutcome {
            cycle,
            code,
            tries: last_tries,
            elapsed: started.elapsed(),
            stop,
        }
    }
}
