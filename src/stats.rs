//! In-memory activity instrumentation.
//!
//! Tracks cycle service timings, success/error splits, the tries histogram,
//! and named error counters with rolling window statistics (configurable,
//! default 60 seconds).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Tries above this land in the final histogram bucket.
pub const TRIES_HISTOGRAM_BUCKETS: usize = 16;

/// A single timing sample with timestamp.
#[derive(Debug, Clone, Copy)]
struct Sample {
    timestamp: Instant,
    value_us: u64,
}

/// A metric that tracks samples within a rolling time window.
#[derive(Debug)]
struct RollingMetric {
    samples: VecDeque<Sample>,
    window: Duration,
}

impl RollingMetric {
    fn new(window: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(10000),
            window,
        }
    }

    fn record(&mut self, value_us: u64) {
        let now = Instant::now();
        self.samples.push_back(Sample {
            timestamp: now,
            value_us,
        });
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        let cutoff = now - self.window;
        while let Some(front) = self.samples.front() {
            if front.timestamp < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn stats(&mut self) -> MetricStats {
        let now = Instant::now();
        self.prune(now);

        if self.samples.is_empty() {
            return MetricStats::default();
        }

        let mut values: Vec<u64> = self.samples.iter().map(|s| s.value_us).collect();
        values.sort_unstable();

        let count = values.len();
        let sum: u64 = values.iter().sum();

        MetricStats {
            count: count as u64,
            mean_us: sum / count as u64,
            min_us: values[0],
            max_us: values[count - 1],
            p50_us: values[count / 2],
            p95_us: values[(count as f64 * 0.95) as usize],
            p99_us: values[(count as f64 * 0.99) as usize],
        }
    }
}

/// Statistics for a single metric.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricStats {
    pub count: u64,
    pub mean_us: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}

impl MetricStats {
    /// Format as a concise string for logging.
    pub fn format(&self) -> String {
        if self.count == 0 {
            return "n=0".to_string();
        }
        format!(
            "n={} mean={:.1}ms p50={:.1}ms p95={:.1}ms p99={:.1}ms min={:.1}ms max={:.1}ms",
            self.count,
            self.mean_us as f64 / 1000.0,
            self.p50_us as f64 / 1000.0,
            self.p95_us as f64 / 1000.0,
            self.p99_us as f64 / 1000.0,
            self.min_us as f64 / 1000.0,
            self.max_us as f64 / 1000.0,
        )
    }
}

/// Live instrumentation shared by every worker of an activity.
pub struct ActivityMetrics {
    cycle_timer: Mutex<RollingMetric>,
    success_timer: Mutex<RollingMetric>,
    error_timer: Mutex<RollingMetric>,
    tries: [AtomicU64; TRIES_HISTOGRAM_BUCKETS],
    counters: Mutex<HashMap<String, u64>>,
    success_count: AtomicU64,
    error_count: AtomicU64,
}

impl ActivityMetrics {
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(60))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            cycle_timer: Mutex::new(RollingMetric::new(window)),
            success_timer: Mutex::new(RollingMetric::new(window)),
            error_timer: Mutex::new(RollingMetric::new(window)),
            tries: std::array::from_fn(|_| AtomicU64::new(0)),
            counters: Mutex::new(HashMap::new()),
            success_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        }
    }

    /// Records one attempt's service time, split by outcome.
    pub fn record_attempt(&self, elapsed: Duration, success: bool) {
        let value_us = elapsed.as_micros() as u64;
        self.cycle_timer.lock().unwrap().record(value_us);
        if success {
            self.success_count.fetch_add(1, Ordering::Relaxed);
            self.success_timer.lock().unwrap().record(value_us);
        } else {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            self.error_timer.lock().unwrap().record(value_us);
        }
    }

    /// Records how many tries one op took before settling.
    pub fn record_tries(&self, tries: u32) {
        let bucket = (tries.max(1) as usize).min(TRIES_HISTOGRAM_BUCKETS) - 1;
        self.tries[bucket].fetch_add(1, Ordering::Relaxed);
    }

    /// Increments a named counter (used by `count`-classified errors).
    pub fn increment_counter(&self, name: &str) {
        let mut counters = self.counters.lock().unwrap();
        *counters.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Ops that settled after exactly `tries` attempts.
    pub fn tries_count(&self, tries: u32) -> u64 {
        if tries == 0 || tries as usize > TRIES_HISTOGRAM_BUCKETS {
            return 0;
        }
        self.tries[tries as usize - 1].load(Ordering::Relaxed)
    }

    pub fn success_count(&self) -> u64 {
        self.success_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cycle: self.cycle_timer.lock().unwrap().stats(),
            success: self.success_timer.lock().unwrap().stats(),
            error: self.error_timer.lock().unwrap().stats(),
            tries: self
                .tries
                .iter()
                .enumerate()
                .map(|(i, count)| (i as u32 + 1, count.load(Ordering::Relaxed)))
                .filter(|(_, count)| *count > 0)
                .collect(),
            counters: self.counters.lock().unwrap().clone(),
            success_count: self.success_count(),
            error_count: self.error_count(),
        }
    }
}

impl Default for ActivityMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of all activity metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub cycle: MetricStats,
    pub success: MetricStats,
    pub error: MetricStats,
    /// `(tries, ops)` pairs for non-empty histogram buckets.
    pub tries: Vec<(u32, u64)>,
    pub counters: HashMap<String, u64>,
    pub success_count: u64,
    pub error_count: u64,
}
