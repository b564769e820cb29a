//! Activity configuration.
//!
//! Plain structs with defaults, deserializable so an outer CLI or config
//! file layer can populate them. The two string formats of the engine's
//! external interface, rate specs (`"5000,1.05"`) and error policies
//! (`"timeout=retry,conflict=warn,stop"`), parse via `FromStr`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::ops::SequencerMode;
use crate::tracker::TrackerWidth;

/// Target rate plus allowed burst ratio.
///
/// The burst ratio bounds how far actual throughput may run ahead of the
/// ideal schedule to absorb a caller that fell behind; 1.0 means strict
/// pacing with no catch-up. A non-positive rate disables pacing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateSpec {
    pub ops_per_sec: f64,
    pub burst_ratio: f64,
}

pub const DEFAULT_BURST_RATIO: f64 = 1.1;

impl RateSpec {
    pub fn new(ops_per_sec: f64, burst_ratio: f64) -> Self {
        Self {
            ops_per_sec,
            burst_ratio,
        }
    }

    /// A spec that disables pacing entirely.
    pub fn unlimited() -> Self {
        Self::new(0.0, 1.0)
    }

    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidRateSpec {
            spec: spec.to_string(),
            reason,
        };
        let mut parts = spec.splitn(2, ',').map(str::trim);
        let rate = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| invalid("missing rate".to_string()))?;
        let ops_per_sec: f64 = rate
            .parse()
            .map_err(|_| invalid(format!("unparsable rate '{rate}'")))?;
        let burst_ratio = match parts.next() {
            Some(burst) => burst
                .parse()
                .map_err(|_| invalid(format!("unparsable burst ratio '{burst}'")))?,
            None => DEFAULT_BURST_RATIO,
        };
        if burst_ratio < 1.0 {
            return Err(invalid(format!("burst ratio {burst_ratio} is below 1.0")));
        }
        Ok(Self::new(ops_per_sec, burst_ratio))
    }
}

impl FromStr for RateSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for RateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.ops_per_sec, self.burst_ratio)
    }
}

/// How workers hand cycles to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// A worker fully completes each cycle before drawing the next.
    #[default]
    Sync,
    /// Workers submit cycles through the pending-op gate to a completion
    /// pool; up to `max_pending` cycles are in flight at once and may
    /// complete in any order.
    Async { max_pending: usize },
}

/// Full parameter set for one activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    /// First cycle to execute.
    pub start_cycle: u64,
    /// One past the last cycle to execute.
    pub end_cycle: u64,
    /// Worker threads. In async mode the completion pool is sized the same.
    pub threads: usize,
    /// Cycles drawn per stride; the stride limiter blocks once per stride.
    pub stride: u64,
    /// Execution attempts per op, 1-indexed.
    pub max_tries: u32,
    /// Per-cycle pacing, if any.
    pub cycle_rate: Option<RateSpec>,
    /// Per-stride pacing, if any.
    pub stride_rate: Option<RateSpec>,
    /// Ordered `pattern=response` rules plus a bare default.
    pub error_policy: String,
    pub dispatch: DispatchMode,
    pub seq: SequencerMode,
    pub tracker_width: TrackerWidth,
    /// Append-only completion log; also the resume source when `resume`.
    pub completion_log: Option<PathBuf>,
    /// Skip cycles recorded complete in an existing completion log.
    pub resume: bool,
    /// How long shutdown waits for in-flight ops to drain.
    pub drain_timeout_ms: u64,
    /// How long an async submitter waits for a gate slot before the run is
    /// declared stuck.
    pub reserve_timeout_ms: u64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            start_cycle: 0,
            end_cycle: 1,
            threads: num_cpus::get().max(1),
            stride: 1,
            max_tries: 3,
            cycle_rate: None,
            stride_rate: None,
            error_policy: "stop".to_string(),
            dispatch: DispatchMode::Sync,
            seq: SequencerMode::Concat,
            tracker_width: TrackerWidth::Narrow,
            completion_log: None,
            resume: false,
            drain_timeout_ms: 30_000,
            reserve_timeout_ms: 30_000,
        }
    }
}

impl ActivityConfig {
    /// Convenience constructor for the common fixed-range case.
    pub fn over_cycles(start_cycle: u64, end_cycle: u64) -> Self {
        Self {
            start_cycle,
            end_cycle,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.end_cycle <= self.start_cycle {
            return Err(ConfigError::EmptyCycleRange {
                start: self.start_cycle,
                end: self.end_cycle,
            });
        }
        if self.max_tries == 0 {
            return Err(ConfigError::ZeroMaxTries);
        }
        Ok(())
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn reserve_timeout(&self) -> Duration {
        Duration::from_millis(self.reserve_timeout_ms)
    }
}

/// Parameters an operator may change while the activity runs. Applied by the
/// owning activity through one update path; components observe the change on
/// their next call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigUpdate {
    pub cycle_rate: Option<RateSpec>,
    pub stride_rate: Option<RateSpec>,
    pub max_tries: Option<u32>,
    pub max_pending: Option<usize>,
    pub error_policy: Option<String>,
}
