//! Op synthesis and deterministic cycle-to-template routing.
//!
//! An [`Op`] is the executable unit synthesized for one cycle. Its capability
//! is fixed at dispense time as a tagged variant (fire-and-forget, value
//! producing, or chaining off the prior op's result), optionally with a
//! follow-up hook that yields secondary ops for the same cycle. Dispensers
//! are arranged into an [`OpSequence`], a weighted routing table that maps a
//! cycle number to a dispenser as a pure function, so dispensing is
//! reproducible from the cycle number alone.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ConfigError, OpError};

/// Per-worker scratch state handed to data-synthesis functions, replacing
/// hidden thread-local state with an explicit context object.
pub struct SynthContext {
    slot: usize,
    scratch: HashMap<String, Value>,
}

impl SynthContext {
    pub fn new(slot: usize) -> Self {
        Self {
            slot,
            scratch: HashMap::new(),
        }
    }

    /// The worker slot this context belongs to.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.scratch.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.scratch.insert(key.into(), value);
    }

    pub fn clear(&mut self) {
        self.scratch.clear();
    }
}

/// A deterministic per-cycle value source supplied by the external
/// data-synthesis library. Must be a pure function of the cycle number
/// (modulo its scratch context).
pub type FieldSource = Arc<dyn Fn(u64, &mut SynthContext) -> Value + Send + Sync>;

/// Optional post-execution check evaluated against an op's result. A
/// rejection is classified exactly like an execution error.
pub type Verifier = Arc<dyn Fn(u64, &Value) -> Result<(), String> + Send + Sync>;

type RunFn = Box<dyn FnMut(u64) -> Result<(), OpError> + Send>;
type ApplyFn = Box<dyn FnMut(u64) -> Result<Value, OpError> + Send>;
type ChainFn = Box<dyn FnMut(Value) -> Result<Value, OpError> + Send>;
type FollowUpFn = Box<dyn FnMut() -> Option<Op> + Send>;

enum OpBody {
    /// Fire-and-forget; produces no result value.
    Runnable(RunFn),
    /// Produces a typed result from the cycle number.
    Value(ApplyFn),
    /// Consumes the prior op's result and produces a new one.
    Chaining(ChainFn),
}

/// One executable unit of work, instantiated fresh per cycle.
pub struct Op {
    body: OpBody,
    follow_up: Option<FollowUpFn>,
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = match self.body {
            OpBody::Runnable(_) => "Runnable",
            OpBody::Value(_) => "Value",
            OpBody::Chaining(_) => "Chaining",
        };
        f.debug_struct("Op")
            .field("body", &body)
            .field("follow_up", &self.follow_up.is_some())
            .finish()
    }
}

impl Op {
    pub fn runnable(f: impl FnMut(u64) -> Result<(), OpError> + Send + 'static) -> Self {
        Self {
            body: OpBody::Runnable(Box::new(f)),
            follow_up: None,
        }
    }

    pub fn value(f: impl FnMut(u64) -> Result<Value, OpError> + Send + 'static) -> Self {
        Self {
            body: OpBody::Value(Box::new(f)),
            follow_up: None,
        }
    }

    pub fn chaining(f: impl FnMut(Value) -> Result<Value, OpError> + Send + 'static) -> Self {
        Self {
            body: OpBody::Chaining(Box::new(f)),
            follow_up: None,
        }
    }

    /// Attaches a generator hook that may yield a follow-on op after this
    /// one settles, forming a chain of secondary operations for one cycle.
    pub fn with_follow_up(mut self, f: impl FnMut() -> Option<Op> + Send + 'static) -> Self {
        self.follow_up = Some(Box::new(f));
        self
    }

    /// Whether this op consumes the prior op's result.
    pub fn is_chaining(&self) -> bool {
        matches!(self.body, OpBody::Chaining(_))
    }

    /// Executes the op according to its capability. Runnable ops yield
    /// `Value::Null`; chaining ops receive the prior result (or `Null` when
    /// they open the chain).
    pub(crate) fn invoke(&mut self, cycle: u64, prior: Option<&Value>) -> Result<Value, OpError> {
        match &mut self.body {
            OpBody::Runnable(f) => f(cycle).map(|()| Value::Null),
            OpBody::Value(f) => f(cycle),
            OpBody::Chaining(f) => f(prior.cloned().unwrap_or(Value::Null)),
        }
    }

    /// Asks the generator hook for the next op in this cycle's chain.
    pub(crate) fn next_op(&mut self) -> Option<Op> {
        self.follow_up.as_mut().and_then(|f| f())
    }
}

/// Factory bound to one operation template: `dispense(cycle)` binds the
/// cycle's synthesized field values into a fresh [`Op`]. Dispensing must be
/// side-effect-free beyond instrumentation, so re-dispensing for a retry is
/// equivalent to the original attempt.
pub trait OpDispenser: Send + Sync {
    fn name(&self) -> &str;

    fn dispense(&self, cycle: u64, ctx: &mut SynthContext) -> Result<Op, OpError>;

    /// Result check applied after each execution, if any.
    fn verifier(&self) -> Option<Verifier> {
        None
    }
}

/// One entry of the operation-template catalog supplied by the workload
/// layer: a named template with a routing weight and a backend op kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpTemplate {
    pub name: String,
    pub kind: String,
    pub weight: usize,
}

impl OpTemplate {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, weight: usize) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            weight,
        }
    }
}

/// Resolves op templates into dispensers. Implemented by backend adapters;
/// resolution failures abort activity construction rather than surfacing
/// mid-run.
pub trait OpMapper {
    fn resolve(&self, template: &OpTemplate) -> Result<Arc<dyn OpDispenser>, ConfigError>;
}

/// How template weights are laid out into the routing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SequencerMode {
    /// Each template occupies a contiguous run: weights 2,3 give AABBB.
    #[default]
    Concat,
    /// Templates interleave, draining weights round-robin: 2,3 give ABABB.
    Bucket,
}

/// Deterministic cycle-to-dispenser routing over a precomputed ratio table.
pub struct OpSequence {
    dispensers: Vec<Arc<dyn OpDispenser>>,
    table: Vec<usize>,
}

impl fmt::Debug for OpSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpSequence")
            .field(
                "dispensers",
                &self.dispensers.iter().map(|d| d.name()).collect::<Vec<_>>(),
            )
            .field("table", &self.table)
            .finish()
    }
}

impl OpSequence {
    /// Resolves every template up front and lays out the routing table.
    /// Fails fast on unresolvable templates or an all-zero weight set.
    pub fn build(
        templates: &[OpTemplate],
        mapper: &dyn OpMapper,
        mode: SequencerMode,
    ) -> Result<Self, ConfigError> {
        let mut dispensers = Vec::with_capacity(templates.len());
        for template in templates {
            dispensers.push(mapper.resolve(template)?);
        }
        let weights: Vec<usize> = templates.iter().map(|t| t.weight).collect();
        let table = Self::plan(&weights, mode);
        if table.is_empty() {
            return Err(ConfigError::EmptySequence);
        }
        Ok(Self { dispensers, table })
    }

    fn plan(weights: &[usize], mode: SequencerMode) -> Vec<usize> {
        let mut table = Vec::with_capacity(weights.iter().sum());
        match mode {
            SequencerMode::Concat => {
                for (index, &weight) in weights.iter().enumerate() {
                    table.extend(std::iter::repeat(index).take(weight));
                }
            }
            SequencerMode::Bucket => {
                let mut remaining = weights.to_vec();
                while remaining.iter().any(|&w| w > 0) {
                    for (index, left) in remaining.iter_mut().enumerate() {
                        if *left > 0 {
                            *left -= 1;
                            table.push(index);
                        }
                    }
                }
            }
        }
        table
    }

    /// Pure routing: which template answers this cycle. Reproducible across
    /// calls and process restarts for the same configuration.
    pub fn index_for(&self, cycle: u64) -> usize {
        self.table[(cycle % self.table.len() as u64) as usize]
    }

    pub fn dispenser_for(&self, cycle: u64) -> &Arc<dyn OpDispenser> {
        &self.dispensers[self.index_for(cycle)]
    }

    pub fn table_len(&self) -> usize {
        self.table.len()
    }

    pub fn dispenser_count(&self) -> usize {
        self.dispensers.len()
    }
}
