//! Error taxonomy and failure classification.
//!
//! Failures raised while executing an op are classified against an ordered
//! list of `pattern=response` rules into an [`ErrorDetail`] that tells the
//! executor whether to retry, log, count, ignore, or stop the whole activity.
//! Classification itself never fails: rule patterns are compiled when the
//! policy string is parsed, and anything unmatched falls back to the default
//! response (`stop` unless configured otherwise).

use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tracing::warn;

/// Configuration-time failures. These abort activity construction; they are
/// never raised mid-run.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid rate spec '{spec}': {reason}")]
    InvalidRateSpec { spec: String, reason: String },
    #[error("invalid error policy '{policy}': {reason}")]
    InvalidErrorPolicy { policy: String, reason: String },
    #[error("op template '{template}' has unknown kind '{kind}'")]
    UnknownOpKind { template: String, kind: String },
    #[error("op sequence has no templates with positive weight")]
    EmptySequence,
    #[error("cycle range {start}..{end} is empty")]
    EmptyCycleRange { start: u64, end: u64 },
    #[error("max_tries must be at least 1")]
    ZeroMaxTries,
}

/// Completion-tracker input errors. Marking outside the tracked range is a
/// logic fault in the caller, fatal rather than retryable.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("index {index} outside segment width {width}")]
    IndexOutOfRange { index: usize, width: usize },
    #[error("cycle {cycle} outside tracked range {start}..{end}")]
    CycleOutOfRange { cycle: u64, start: u64, end: u64 },
}

/// A failure surfaced while dispensing, executing, or verifying one op.
///
/// The `name` of an error is what the classifier matches rules against,
/// mirroring how backends tag their failures (`Timeout`, `Conflict`, ...).
#[derive(Debug, Error)]
pub enum OpError {
    #[error("backend error [{name}]: {source}")]
    Backend {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("result verification failed: {reason}")]
    Verification { reason: String },
    #[error("dispense failed for cycle {cycle}: {source}")]
    Dispense {
        cycle: u64,
        #[source]
        source: anyhow::Error,
    },
}

impl OpError {
    pub fn backend(name: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Backend {
            name: name.into(),
            source: source.into(),
        }
    }

    /// The name classification rules are matched against.
    pub fn name(&self) -> &str {
        match self {
            Self::Backend { name, .. } => name,
            Self::Verification { .. } => "VerificationError",
            Self::Dispense { .. } => "DispenseError",
        }
    }
}

/// Run-level failures reported by [`crate::activity::Activity::join`].
#[derive(Debug, Error)]
pub enum ActivityError {
    #[error("activity stopped by error policy at cycle {cycle} (code {code})")]
    Stopped { cycle: u64, code: u8 },
    #[error("timed out after {timeout:?} waiting for an in-flight op slot")]
    BackpressureTimeout { timeout: Duration },
    #[error("in-flight ops failed to drain within {timeout:?}")]
    DrainTimeout { timeout: Duration },
    #[error("worker thread panicked")]
    WorkerPanicked,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error("completion log error: {0}")]
    CompletionLog(#[from] std::io::Error),
}

/// Result code reported for a cycle whose dispense step failed.
pub const CODE_DISPENSE_ERROR: u8 = 6;

/// What to do about a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorResponse {
    /// Abort the activity after draining in-flight ops.
    Stop,
    /// Log and continue; not retried.
    Warn,
    /// Attempt again, up to the configured max tries.
    Retry,
    /// Increment a named counter and continue; not retried.
    Count,
    /// Swallow silently.
    Ignore,
}

impl ErrorResponse {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Retry)
    }

    /// Stable result code reported for cycles ending in this response.
    pub fn result_code(self) -> u8 {
        match self {
            Self::Stop => 1,
            Self::Warn => 2,
            Self::Retry => 3,
            Self::Count => 4,
            Self::Ignore => 5,
        }
    }

    fn parse(token: &str) -> Option<Self> {
        match token {
            "stop" => Some(Self::Stop),
            "warn" => Some(Self::Warn),
            "retry" => Some(Self::Retry),
            "count" => Some(Self::Count),
            "ignore" => Some(Self::Ignore),
            _ => None,
        }
    }
}

/// Classification result for one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorDetail {
    pub response: ErrorResponse,
    pub result_code: u8,
    pub retryable: bool,
}

impl ErrorDetail {
    fn of(response: ErrorResponse) -> Self {
        Self {
            response,
            result_code: response.result_code(),
            retryable: response.is_retryable(),
        }
    }
}

struct Rule {
    pattern: Regex,
    raw: String,
    response: ErrorResponse,
}

/// Ordered name-pattern rules mapping failures to responses.
pub struct ErrorClassifier {
    rules: Vec<Rule>,
    default: ErrorResponse,
}

impl ErrorClassifier {
    /// Parses a policy string of ordered `pattern=response` tokens plus an
    /// optional bare default, e.g. `"timeout=retry,conflict=warn,stop"`.
    /// Patterns are anchored regexes matched against the error name.
    pub fn parse(policy: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidErrorPolicy {
            policy: policy.to_string(),
            reason,
        };
        let mut rules = Vec::new();
        let mut default = None;
        for token in policy.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token.split_once('=') {
                Some((pattern, response)) => {
                    let response = ErrorResponse::parse(response.trim())
                        .ok_or_else(|| invalid(format!("unknown response '{response}'")))?;
                    let anchored = format!("^(?:{})$", pattern.trim());
                    let pattern = Regex::new(&anchored)
                        .map_err(|e| invalid(format!("bad pattern '{pattern}': {e}")))?;
                    rules.push(Rule {
                        pattern,
                        raw: token.to_string(),
                        response,
                    });
                }
                None => {
                    let response = ErrorResponse::parse(token)
                        .ok_or_else(|| invalid(format!("unknown token '{token}'")))?;
                    if default.replace(response).is_some() {
                        return Err(invalid("more than one default response".to_string()));
                    }
                }
            }
        }
        Ok(Self {
            rules,
            default: default.unwrap_or(ErrorResponse::Stop),
        })
    }

    /// Classifies a failure by name. Infallible: unmatched names take the
    /// default response, and `stop` wins when several rules match.
    pub fn classify(&self, error_name: &str) -> ErrorDetail {
        let mut first_match = None;
        for rule in &self.rules {
            if rule.pattern.is_match(error_name) {
                if rule.response == ErrorResponse::Stop {
                    return ErrorDetail::of(ErrorResponse::Stop);
                }
                first_match.get_or_insert(rule.response);
            }
        }
        let response = first_match.unwrap_or_else(|| {
            if self.default == ErrorResponse::Stop {
                warn!(error_name, "unclassified error, stopping by default");
            }
            self.default
        });
        ErrorDetail::of(response)
    }

    pub fn default_response(&self) -> ErrorResponse {
        self.default
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// The raw tokens of the configured rules, for diagnostics.
    pub fn describe(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.raw.as_str()).collect()
    }
}
