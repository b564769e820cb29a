//! End-to-end engine scenarios.
//!
//! These tests drive a full [`Activity`] the way an embedding workload
//! driver would: templates resolved through a mapper, worker threads drawing
//! from the shared cycle source, pacing, retries, classification, completion
//! tracking, and log-based resume all wired together.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use serde_json::Value;

use paceline::{
    Activity, ActivityConfig, ActivityError, CompletionLog, ConfigError, ConfigUpdate,
    DispatchMode, Op, OpDispenser, OpError, OpMapper, OpTemplate, RateSpec, SegmentRecord,
    SynthContext,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Records every executed cycle and how many times it ran.
struct RecordingDispenser {
    name: String,
    executions: Arc<Mutex<HashMap<u64, u64>>>,
}

impl OpDispenser for RecordingDispenser {
    fn name(&self) -> &str {
        &self.name
    }

    fn dispense(&self, _cycle: u64, _ctx: &mut SynthContext) -> Result<Op, OpError> {
        let executions = Arc::clone(&self.executions);
        Ok(Op::value(move |cycle| {
            *executions.lock().unwrap().entry(cycle).or_insert(0) += 1;
            Ok(Value::from(cycle))
        }))
    }
}

/// Fails every first attempt of each cycle with a retryable error.
struct FlakyDispenser {
    attempts: Arc<Mutex<HashMap<u64, u64>>>,
}

impl OpDispenser for FlakyDispenser {
    fn name(&self) -> &str {
        "flaky"
    }

    fn dispense(&self, _cycle: u64, _ctx: &mut SynthContext) -> Result<Op, OpError> {
        let attempts = Arc::clone(&self.attempts);
        Ok(Op::value(move |cycle| {
            let mut attempts = attempts.lock().unwrap();
            let attempt = attempts.entry(cycle).or_insert(0);
            *attempt += 1;
            if *attempt == 1 {
                Err(OpError::backend("Timeout", anyhow!("first attempt fails")))
            } else {
                Ok(Value::from(cycle))
            }
        }))
    }
}

struct ScenarioMapper {
    dispensers: HashMap<String, Arc<dyn OpDispenser>>,
}

impl ScenarioMapper {
    fn single(dispenser: Arc<dyn OpDispenser>) -> Self {
        let mut dispensers: HashMap<String, Arc<dyn OpDispenser>> = HashMap::new();
        dispensers.insert("any".to_string(), dispenser);
        Self { dispensers }
    }
}

impl OpMapper for ScenarioMapper {
    fn resolve(&self, template: &OpTemplate) -> Result<Arc<dyn OpDispenser>, ConfigError> {
        self.dispensers
            .get(&template.kind)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownOpKind {
                template: template.name.clone(),
                kind: template.kind.clone(),
            })
    }
}

fn one_template() -> Vec<OpTemplate> {
    vec![OpTemplate::new("only", "any", 1)]
}

#[test]
fn paced_multi_threaded_run_completes_exactly_once() {
    init_tracing();
    let executions = Arc::new(Mutex::new(HashMap::new()));
    let mapper = ScenarioMapper::single(Arc::new(RecordingDispenser {
        name: "record".to_string(),
        executions: Arc::clone(&executions),
    }));
    let mut config = ActivityConfig::over_cycles(0, 400);
    config.threads = 4;
    config.stride = 10;
    config.cycle_rate = Some(RateSpec::new(20_000.0, 1.1));

    let start = Instant::now();
    let activity = Activity::start(&config, &one_template(), &mapper).unwrap();
    let summary = activity.join().unwrap();

    // 400 cycles at 20k/s take at least 20ms of schedule.
    assert!(start.elapsed() >= Duration::from_millis(15));
    assert_eq!(summary.completed, 400);
    assert_eq!(summary.low_water_mark, 400);
    let executions = executions.lock().unwrap();
    assert_eq!(executions.len(), 400);
    assert!(executions.values().all(|&count| count == 1));
    assert_eq!(summary.metrics.success_count, 400);
}

#[test]
fn transient_failures_are_retried_to_success() {
    init_tracing();
    let attempts = Arc::new(Mutex::new(HashMap::new()));
    let mapper = ScenarioMapper::single(Arc::new(FlakyDispenser {
        attempts: Arc::clone(&attempts),
    }));
    let mut config = ActivityConfig::over_cycles(0, 100);
    config.threads = 2;
    config.max_tries = 3;
    config.error_policy = "Timeout=retry,stop".to_string();

    let activity = Activity::start(&config, &one_template(), &mapper).unwrap();
    let summary = activity.join().unwrap();

    assert_eq!(summary.completed, 100);
    // Every cycle took exactly two attempts.
    assert!(attempts.lock().unwrap().values().all(|&n| n == 2));
    assert_eq!(summary.metrics.error_count, 100);
    assert_eq!(summary.metrics.success_count, 100);
    assert!(summary.metrics.tries.contains(&(2, 100)));
}

#[test]
fn stop_policy_halts_a_multi_threaded_run() {
    init_tracing();
    struct OneBadCycle;
    impl OpDispenser for OneBadCycle {
        fn name(&self) -> &str {
            "one-bad-cycle"
        }
        fn dispense(&self, _cycle: u64, _ctx: &mut SynthContext) -> Result<Op, OpError> {
            Ok(Op::runnable(|cycle| {
                if cycle == 42 {
                    Err(OpError::backend("Corrupt", anyhow!("checksum mismatch")))
                } else {
                    Ok(())
                }
            }))
        }
    }
    let mapper = ScenarioMapper::single(Arc::new(OneBadCycle));
    let mut config = ActivityConfig::over_cycles(0, 100_000);
    config.threads = 4;
    config.error_policy = "Timeout=retry,Corrupt=stop".to_string();

    let activity = Activity::start(&config, &one_template(), &mapper).unwrap();
    match activity.join() {
        Err(ActivityError::Stopped { cycle, code }) => {
            assert_eq!(cycle, 42);
            assert_eq!(code, 1);
        }
        other => panic!("expected Stopped, got {other:?}"),
    }
}

#[test]
fn async_dispatch_tolerates_out_of_order_completion() {
    init_tracing();
    struct JitteryDispenser {
        executed: Arc<AtomicU64>,
    }
    impl OpDispenser for JitteryDispenser {
        fn name(&self) -> &str {
            "jittery"
        }
        fn dispense(&self, _cycle: u64, _ctx: &mut SynthContext) -> Result<Op, OpError> {
            let executed = Arc::clone(&self.executed);
            Ok(Op::value(move |cycle| {
                // Uneven service times so completions land out of order.
                if cycle % 7 == 0 {
                    std::thread::sleep(Duration::from_micros(300));
                }
                executed.fetch_add(1, Ordering::Relaxed);
                Ok(Value::from(cycle))
            }))
        }
    }
    let executed = Arc::new(AtomicU64::new(0));
    let mapper = ScenarioMapper::single(Arc::new(JitteryDispenser {
        executed: Arc::clone(&executed),
    }));
    let mut config = ActivityConfig::over_cycles(0, 300);
    config.threads = 3;
    config.stride = 4;
    config.dispatch = DispatchMode::Async { max_pending: 16 };

    let activity = Activity::start(&config, &one_template(), &mapper).unwrap();
    let summary = activity.join().unwrap();
    assert_eq!(executed.load(Ordering::Relaxed), 300);
    assert_eq!(summary.completed, 300);
    assert_eq!(summary.low_water_mark, 300);
    assert_eq!(summary.highest_complete, Some(299));
}

#[test]
fn live_update_lifts_the_rate_mid_run() {
    init_tracing();
    let executions = Arc::new(Mutex::new(HashMap::new()));
    let mapper = ScenarioMapper::single(Arc::new(RecordingDispenser {
        name: "record".to_string(),
        executions: Arc::clone(&executions),
    }));
    let mut config = ActivityConfig::over_cycles(0, 5_000);
    config.threads = 2;
    // Slow enough that the run cannot finish before the update lands.
    config.cycle_rate = Some(RateSpec::new(200.0, 1.1));

    let activity = Activity::start(&config, &one_template(), &mapper).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    activity
        .apply_update(&ConfigUpdate {
            cycle_rate: Some(RateSpec::new(0.0, 1.0)),
            ..ConfigUpdate::default()
        })
        .unwrap();
    let start = Instant::now();
    let summary = activity.join().unwrap();
    // At 200/s the remaining ~4990 cycles would need ~25s; unlimited they
    // finish almost immediately.
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(summary.completed, 5_000);
}

#[test]
fn completed_run_writes_a_full_completion_log() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("completions.jsonl");
    let mapper = ScenarioMapper::single(Arc::new(RecordingDispenser {
        name: "record".to_string(),
        executions: Arc::new(Mutex::new(HashMap::new())),
    }));
    let mut config = ActivityConfig::over_cycles(0, 96);
    config.threads = 3;
    config.completion_log = Some(path.clone());

    let activity = Activity::start(&config, &one_template(), &mapper).unwrap();
    activity.join().unwrap();

    let records = CompletionLog::read(&path).unwrap();
    assert_eq!(records.len(), 3);
    let mut covered: Vec<u64> = records
        .iter()
        .flat_map(SegmentRecord::range)
        .collect();
    covered.sort_unstable();
    assert_eq!(covered, (0..96).collect::<Vec<u64>>());
}

#[test]
fn resumed_run_skips_logged_segments() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("completions.jsonl");
    // A previous run recorded the first two segments complete.
    let log = CompletionLog::open(&path).unwrap();
    for base in [0u64, 32] {
        log.append(&SegmentRecord {
            base,
            width: 32,
            bitmap: vec![u64::from(u32::MAX)],
        })
        .unwrap();
    }
    drop(log);

    let executions = Arc::new(Mutex::new(HashMap::new()));
    let mapper = ScenarioMapper::single(Arc::new(RecordingDispenser {
        name: "record".to_string(),
        executions: Arc::clone(&executions),
    }));
    let mut config = ActivityConfig::over_cycles(0, 128);
    config.threads = 2;
    config.completion_log = Some(path.clone());
    config.resume = true;

    let activity = Activity::start(&config, &one_template(), &mapper).unwrap();
    let summary = activity.join().unwrap();

    let executed: HashSet<u64> = executions.lock().unwrap().keys().copied().collect();
    assert_eq!(executed, (64..128).collect::<HashSet<u64>>());
    assert_eq!(summary.completed, 64);

    // The log now also covers the newly completed segments.
    let records = CompletionLog::read(&path).unwrap();
    let covered: HashSet<u64> = records.iter().flat_map(SegmentRecord::range).collect();
    assert_eq!(covered, (0..128).collect::<HashSet<u64>>());
}

#[test]
fn resuming_a_finished_run_executes_nothing() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("completions.jsonl");
    let mapper = ScenarioMapper::single(Arc::new(RecordingDispenser {
        name: "record".to_string(),
        executions: Arc::new(Mutex::new(HashMap::new())),
    }));
    let mut config = ActivityConfig::over_cycles(0, 64);
    config.threads = 2;
    config.completion_log = Some(path.clone());

    Activity::start(&config, &one_template(), &mapper)
        .unwrap()
        .join()
        .unwrap();

    let executions = Arc::new(Mutex::new(HashMap::new()));
    let mapper = ScenarioMapper::single(Arc::new(RecordingDispenser {
        name: "record".to_string(),
        executions: Arc::clone(&executions),
    }));
    config.resume = true;
    let summary = Activity::start(&config, &one_template(), &mapper)
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(summary.completed, 0);
    assert!(executions.lock().unwrap().is_empty());
}

#[test]
fn weighted_templates_share_the_cycle_stream() {
    init_tracing();
    struct NamedDispenser {
        name: String,
        hits: Arc<AtomicU64>,
    }
    impl OpDispenser for NamedDispenser {
        fn name(&self) -> &str {
            &self.name
        }
        fn dispense(&self, _cycle: u64, _ctx: &mut SynthContext) -> Result<Op, OpError> {
            let hits = Arc::clone(&self.hits);
            Ok(Op::runnable(move |_| {
                hits.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }))
        }
    }
    let read_hits = Arc::new(AtomicU64::new(0));
    let write_hits = Arc::new(AtomicU64::new(0));
    let mut dispensers: HashMap<String, Arc<dyn OpDispenser>> = HashMap::new();
    dispensers.insert(
        "read".to_string(),
        Arc::new(NamedDispenser {
            name: "read".to_string(),
            hits: Arc::clone(&read_hits),
        }),
    );
    dispensers.insert(
        "write".to_string(),
        Arc::new(NamedDispenser {
            name: "write".to_string(),
            hits: Arc::clone(&write_hits),
        }),
    );
    let mapper = ScenarioMapper { dispensers };
    let templates = vec![
        OpTemplate::new("reads", "read", 3),
        OpTemplate::new("writes", "write", 1),
    ];
    let mut config = ActivityConfig::over_cycles(0, 400);
    config.threads = 2;

    let summary = Activity::start(&config, &templates, &mapper)
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(summary.completed, 400);
    // 400 cycles over a 4-slot table: exactly 300 reads and 100 writes.
    assert_eq!(read_hits.load(Ordering::Relaxed), 300);
    assert_eq!(write_hits.load(Ordering::Relaxed), 100);
}
