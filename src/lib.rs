//! Paceline - deterministic, rate-governed cycle execution engine.
//!
//! The engine turns a range of cycle numbers into paced, tracked operation
//! executions: an [`Activity`](activity::Activity) drives worker threads that
//! draw cycle strides from a shared source, route each cycle to a weighted
//! [`OpDispenser`](ops::OpDispenser), execute with bounded retries under an
//! [`ErrorClassifier`](errors::ErrorClassifier) policy, and record completion
//! in a bit-packed [`CompletionTracker`](tracker::CompletionTracker) that
//! tolerates out-of-order finishes.

pub mod activity;
pub mod config;
pub mod errors;
pub mod executor;
pub mod gate;
pub mod ops;
pub mod progress;
pub mod rate;
pub mod stats;
pub mod tracker;

pub use activity::{Activity, ActivitySummary};
pub use config::{ActivityConfig, ConfigUpdate, DispatchMode, RateSpec};
pub use errors::{
    ActivityError, ConfigError, ErrorClassifier, ErrorDetail, ErrorResponse, OpError, TrackerError,
};
pub use executor::{CycleExecutor, CycleOutcome};
pub use gate::PendingOpGate;
pub use ops::{
    FieldSource, Op, OpDispenser, OpMapper, OpSequence, OpTemplate, SequencerMode, SynthContext,
    Verifier,
};
pub use progress::{CompletionLog, CycleSource, SegmentRecord};
pub use rate::RateLimiter;
pub use stats::{ActivityMetrics, MetricStats, MetricsSnapshot};
pub use tracker::{CompletionTracker, MarkOutcome, SegmentImage, TrackerWidth, WideTracker};
