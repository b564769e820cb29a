//! Activity orchestration: worker threads, pacing, and lifecycle.
//!
//! An [`Activity`] owns everything one workload run needs: the shared cycle
//! source, the routing sequence, both rate limiters, the completion tracker,
//! and the worker pool. Workers draw strides of cycles, pace themselves
//! against the stride and cycle limiters, execute each cycle to a terminal
//! outcome, and mark it complete. A stop-classified outcome raises the shared
//! stop flag; every worker observes it at its next draw and winds down, and
//! [`Activity::join`] reports the first cause.
//!
//! Dispatch comes in two shapes. Sync workers complete each cycle inline
//! before drawing the next. Async mode splits submission from completion:
//! submitters reserve a slot in the pending-op gate and hand the cycle to a
//! completion pool over a channel, so up to `max_pending` cycles are in
//! flight at once and may finish in any order.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::{ActivityConfig, ConfigUpdate, DispatchMode};
use crate::errors::{ActivityError, ConfigError, ErrorClassifier};
use crate::executor::{CycleExecutor, CycleOutcome, SharedClassifier};
use crate::gate::PendingOpGate;
use crate::ops::{OpMapper, OpSequence, OpTemplate};
use crate::progress::{CompletionLog, CycleSource};
use crate::rate::RateLimiter;
use crate::stats::{ActivityMetrics, MetricsSnapshot};
use crate::tracker::CompletionTracker;

/// Final accounting for a finished run.
#[derive(Debug, Clone)]
pub struct ActivitySummary {
    /// Cycles marked complete during this run.
    pub completed: u64,
    pub highest_complete: Option<u64>,
    /// Every cycle below this completed during this run.
    pub low_water_mark: u64,
    pub metrics: MetricsSnapshot,
    /// Nanos workers spent blocked in the cycle limiter.
    pub cycle_wait_nanos: u64,
    /// Nanos workers spent blocked in the stride limiter.
    pub stride_wait_nanos: u64,
}

/// State shared by every worker of one activity.
struct ActivityShared {
    source: CycleSource,
    sequence: Arc<OpSequence>,
    classifier: SharedClassifier,
    max_tries: Arc<AtomicU32>,
    cycle_limiter: RateLimiter,
    stride_limiter: RateLimiter,
    tracker: CompletionTracker,
    metrics: Arc<ActivityMetrics>,
    gate: PendingOpGate,
    stride: u64,
    reserve_timeout: Duration,
    stop: AtomicBool,
    /// First stop-classified outcome, kept for the final error report.
    stop_cause: Mutex<Option<(u64, u8)>>,
}

impl ActivityShared {
    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn flag_stop(&self, outcome: &CycleOutcome) {
        let mut cause = self.stop_cause.lock().unwrap();
        if cause.is_none() {
            *cause = Some((outcome.cycle, outcome.code));
        }
        drop(cause);
        self.stop.store(true, Ordering::Relaxed);
    }

    fn executor(&self, slot: usize) -> CycleExecutor {
        CycleExecutor::new(
            Arc::clone(&self.sequence),
            Arc::clone(&self.classifier),
            Arc::clone(&self.max_tries),
            Arc::clone(&self.metrics),
            slot,
        )
    }

    /// Settles one executed cycle: marks the tracker and raises the stop
    /// flag when the outcome demands it.
    fn settle(&self, outcome: &CycleOutcome) -> Result<(), ActivityError> {
        self.tracker.mark_complete(outcome.cycle)?;
        if outcome.stop {
            self.flag_stop(outcome);
        }
        Ok(())
    }
}

/// A running workload: a worker pool driving cycles from a shared source.
pub struct Activity {
    shared: Arc<ActivityShared>,
    workers: Vec<JoinHandle<Result<(), ActivityError>>>,
    drain_timeout: Duration,
}

impl Activity {
    /// Validates the configuration, builds every shared component, and
    /// spawns the worker pool. Construction fails fast; nothing here is
    /// deferred to mid-run.
    pub fn start(
        config: &ActivityConfig,
        templates: &[OpTemplate],
        mapper: &dyn OpMapper,
    ) -> Result<Self, ActivityError> {
        config.validate()?;
        let classifier = Arc::new(ErrorClassifier::parse(&config.error_policy)?);
        let sequence = Arc::new(OpSequence::build(templates, mapper, config.seq)?);

        let (source, log) = match &config.completion_log {
            Some(path) => {
                let source = if config.resume {
                    let records = CompletionLog::read(path)?;
                    CycleSource::resuming(config.start_cycle, config.end_cycle, &records)
                } else {
                    CycleSource::new(config.start_cycle, config.end_cycle)
                };
                (source, Some(CompletionLog::open(path)?))
            }
            None => (
                CycleSource::new(config.start_cycle, config.end_cycle),
                None,
            ),
        };

        let threads = config.threads.max(1);
        let max_pending = match config.dispatch {
            DispatchMode::Sync => threads,
            DispatchMode::Async { max_pending } => max_pending.max(1),
        };

        let shared = Arc::new(ActivityShared {
            source,
            sequence,
            classifier: Arc::new(RwLock::new(classifier)),
            max_tries: Arc::new(AtomicU32::new(config.max_tries)),
            cycle_limiter: config
                .cycle_rate
                .map(RateLimiter::new)
                .unwrap_or_else(RateLimiter::unlimited),
            stride_limiter: config
                .stride_rate
                .map(RateLimiter::new)
                .unwrap_or_else(RateLimiter::unlimited),
            tracker: CompletionTracker::new(
                config.start_cycle,
                config.end_cycle,
                config.tracker_width,
                log,
            ),
            metrics: Arc::new(ActivityMetrics::new()),
            gate: PendingOpGate::new(max_pending),
            stride: config.stride.max(1),
            reserve_timeout: config.reserve_timeout(),
            stop: AtomicBool::new(false),
            stop_cause: Mutex::new(None),
        });

        info!(
            start = config.start_cycle,
            end = config.end_cycle,
            threads,
            stride = config.stride,
            dispatch = ?config.dispatch,
            "activity starting"
        );

        let workers = match config.dispatch {
            DispatchMode::Sync => Self::spawn_sync_workers(&shared, threads)?,
            DispatchMode::Async { .. } => Self::spawn_async_workers(&shared, threads)?,
        };

        Ok(Self {
            shared,
            workers,
            drain_timeout: config.drain_timeout(),
        })
    }

    fn spawn_sync_workers(
        shared: &Arc<ActivityShared>,
        threads: usize,
    ) -> Result<Vec<JoinHandle<Result<(), ActivityError>>>, ActivityError> {
        (0..threads)
            .map(|slot| {
                let shared = Arc::clone(shared);
                std::thread::Builder::new()
                    .name(format!("cycle-worker-{slot}"))
                    .spawn(move || sync_worker(&shared, slot))
                    .map_err(ActivityError::Spawn)
            })
            .collect()
    }

    fn spawn_async_workers(
        shared: &Arc<ActivityShared>,
        threads: usize,
    ) -> Result<Vec<JoinHandle<Result<(), ActivityError>>>, ActivityError> {
        let (tx, rx) = mpsc::channel::<u64>();
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(threads * 2);
        for slot in 0..threads {
            let shared = Arc::clone(shared);
            let tx = tx.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("cycle-submitter-{slot}"))
                    .spawn(move || async_submitter(&shared, tx))
                    .map_err(ActivityError::Spawn)?,
            );
        }
        for slot in 0..threads {
            let shared = Arc::clone(shared);
            let rx = Arc::clone(&rx);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("cycle-completer-{slot}"))
                    // Completion slots numbered after the submitters so each
                    // synth context stays distinct.
                    .spawn(move || async_completer(&shared, rx, threads + slot))
                    .map_err(ActivityError::Spawn)?,
            );
        }
        // The submitters hold the only remaining senders; the channel closes
        // when the last one finishes, which is what stops the completers.
        drop(tx);
        Ok(workers)
    }

    /// Requests a cooperative stop. Workers observe the flag at their next
    /// cycle boundary; in-flight ops still drain.
    pub fn request_stop(&self) {
        self.shared.stop.store(true, Ordering::Relaxed);
    }

    /// Applies a runtime parameter change. Each component observes its new
    /// value on the next call; nothing is interrupted mid-cycle.
    pub fn apply_update(&self, update: &ConfigUpdate) -> Result<(), ConfigError> {
        if let Some(policy) = &update.error_policy {
            let classifier = Arc::new(ErrorClassifier::parse(policy)?);
            *self.shared.classifier.write().unwrap() = classifier;
        }
        if let Some(rate) = update.cycle_rate {
            self.shared.cycle_limiter.apply_spec(rate);
        }
        if let Some(rate) = update.stride_rate {
            self.shared.stride_limiter.apply_spec(rate);
        }
        if let Some(tries) = update.max_tries {
            self.shared.max_tries.store(tries.max(1), Ordering::Relaxed);
        }
        if let Some(max_pending) = update.max_pending {
            self.shared.gate.set_max(max_pending.max(1));
        }
        Ok(())
    }

    /// Point-in-time metrics for a run in progress.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Cycles marked complete so far.
    pub fn completed(&self) -> u64 {
        self.shared.tracker.total_complete()
    }

    /// Ops currently in flight through the gate (always zero in sync mode).
    pub fn pending_ops(&self) -> usize {
        self.shared.gate.pending()
    }

    /// Waits for every worker to finish and in-flight ops to drain, then
    /// reports either the final summary or the first failure.
    pub fn join(self) -> Result<ActivitySummary, ActivityError> {
        let mut first_error = None;
        for worker in self.workers {
            match worker.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    first_error.get_or_insert(err);
                }
                Err(_) => {
                    first_error.get_or_insert(ActivityError::WorkerPanicked);
                }
            }
        }
        if !self.shared.gate.await_completion(self.drain_timeout) {
            return Err(ActivityError::DrainTimeout {
                timeout: self.drain_timeout,
            });
        }
        if let Some(err) = first_error {
            return Err(err);
        }
        if let Some((cycle, code)) = *self.shared.stop_cause.lock().unwrap() {
            warn!(cycle, code, "activity stopped by error policy");
            return Err(ActivityError::Stopped { cycle, code });
        }
        let summary = ActivitySummary {
            completed: self.shared.tracker.total_complete(),
            highest_complete: self.shared.tracker.highest_complete(),
            low_water_mark: self.shared.tracker.low_water_mark(),
            metrics: self.shared.metrics.snapshot(),
            cycle_wait_nanos: self.shared.cycle_limiter.total_waited_nanos(),
            stride_wait_nanos: self.shared.stride_limiter.total_waited_nanos(),
        };
        info!(
            completed = summary.completed,
            low_water_mark = summary.low_water_mark,
            "activity finished"
        );
        Ok(summary)
    }
}

/// Sync dispatch: one thread draws, paces, executes, and settles inline.
fn sync_worker(shared: &ActivityShared, slot: usize) -> Result<(), ActivityError> {
    let mut executor = shared.executor(slot);
    while !shared.stopping() {
        let Some(stride) = shared.source.next_stride(shared.stride) else {
            break;
        };
        shared.stride_limiter.block();
        for cycle in stride {
            if shared.stopping() {
                break;
            }
            shared.cycle_limiter.block();
            let outcome = executor.run_cycle(cycle);
            shared.settle(&outcome)?;
        }
    }
    Ok(())
}

/// Async dispatch, submission half: pace, reserve an in-flight slot, and
/// hand the cycle to the completion pool.
fn async_submitter(shared: &ActivityShared, tx: Sender<u64>) -> Result<(), ActivityError> {
    while !shared.stopping() {
        let Some(stride) = shared.source.next_stride(shared.stride) else {
            break;
        };
        shared.stride_limiter.block();
        for cycle in stride {
            if shared.stopping() {
                break;
            }
            shared.cycle_limiter.block();
            if !shared.gate.reserve(shared.reserve_timeout) {
                // A full gate for this long means completions have wedged;
                // stop the run rather than submit into a black hole.
                shared.stop.store(true, Ordering::Relaxed);
                return Err(ActivityError::BackpressureTimeout {
                    timeout: shared.reserve_timeout,
                });
            }
            if tx.send(cycle).is_err() {
                // Completion pool is gone; its own error is the real cause.
                shared.gate.release();
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Async dispatch, completion half: execute and settle cycles until the
/// submitters hang up.
fn async_completer(
    shared: &ActivityShared,
    rx: Arc<Mutex<Receiver<u64>>>,
    slot: usize,
) -> Result<(), ActivityError> {
    let mut executor = shared.executor(slot);
    loop {
        let next = rx.lock().unwrap().recv();
        let Ok(cycle) = next else {
            return Ok(());
        };
        let outcome = executor.run_cycle(cycle);
        let settled = shared.settle(&outcome);
        shared.gate.release();
        settled?;
    }
}
