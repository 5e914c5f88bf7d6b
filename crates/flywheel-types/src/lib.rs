//! Shared types, errors, context, and meters for the Flywheel pipeline engine.
//!
//! This crate provides the foundational types used by the engine crate:
//! - `FlywheelError` — unified error taxonomy
//! - `Context` — per-run state threaded through every handler invocation
//! - `MeterBank` — per-mode running averages
//! - `DisplaySurface` / `ProgressHandle` — live progress registration surface

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Unified error type for all Flywheel subsystems.
#[derive(Debug, thiserror::Error)]
pub enum FlywheelError {
    // === Run Control ===
    #[error("Run terminated by handler '{origin}'")]
    Terminated { origin: String },

    #[error("Handler '{node}' failed: {source}")]
    StageFailed {
        node: String,
        #[source]
        source: anyhow::Error,
    },

    // === Tree Mutation Errors ===
    #[error("Node '{node}' is already attached to container '{parent}'")]
    AlreadyAttached { node: String, parent: String },

    #[error("Node '{node}' is not a group and cannot hold children")]
    NotAGroup { node: String },

    #[error("Index {index} out of bounds for container '{container}' of length {len}")]
    IndexOutOfBounds {
        container: String,
        index: usize,
        len: usize,
    },

    #[error("Range {start}..{end} invalid for container '{container}' of length {len}")]
    InvalidRange {
        container: String,
        start: usize,
        end: usize,
        len: usize,
    },

    #[error("Attaching node '{node}' would create a cycle")]
    WouldCycle { node: String },

    #[error("Stale node handle: the slot was freed or reused")]
    StaleHandle,

    // === Build Errors ===
    #[error("Pipeline build failed: {0}")]
    Build(String),
}

impl FlywheelError {
    /// The id of the handler this error points at, when it points at one.
    pub fn node(&self) -> Option<&str> {
        match self {
            FlywheelError::Terminated { origin } => Some(origin),
            FlywheelError::StageFailed { node, .. } => Some(node),
            FlywheelError::AlreadyAttached { node, .. } => Some(node),
            FlywheelError::NotAGroup { node } => Some(node),
            FlywheelError::WouldCycle { node } => Some(node),
            _ => None,
        }
    }

    /// Returns `true` when the error reports an intentional abort rather
    /// than a malfunction.
    pub fn is_abort(&self) -> bool {
        matches!(self, FlywheelError::Terminated { .. })
    }
}

/// A convenience alias for `Result<T, FlywheelError>`.
pub type Result<T> = std::result::Result<T, FlywheelError>;

/// Process rank within a distributed run. Rank 0 is the coordinating process.
pub type Rank = usize;

// ---------------------------------------------------------------------------
// Mode — which phase of the run is executing
// ---------------------------------------------------------------------------

/// Execution mode, switched by mode stages as the run moves between its
/// training, validation, evaluation, and prediction phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Train,
    Val,
    Eval,
    Predict,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Train => "train",
            Mode::Val => "val",
            Mode::Eval => "eval",
            Mode::Predict => "predict",
        }
    }

    /// Key prefix applied when reporting meter values for this mode, so a
    /// validation pass does not shadow the training numbers it interleaves
    /// with.
    pub fn key_prefix(&self) -> &'static str {
        match self {
            Mode::Val => "val_",
            _ => "",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RunPlan / Schedule — epoch schedule configuration and progress
// ---------------------------------------------------------------------------

/// Schedule configuration consumed by the standard builders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPlan {
    /// Total number of epochs the epoch loop executes.
    pub epochs: usize,
}

impl Default for RunPlan {
    fn default() -> Self {
        Self { epochs: 1 }
    }
}

/// Epoch schedule state, advanced by the epoch loop.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Schedule {
    pub total_epochs: usize,
    pub current_epoch: usize,
}

/// Per-batch state, rewritten by the batch loop before each round.
#[derive(Debug, Clone, Default)]
pub struct StepState {
    pub index: usize,
    pub total: usize,
    /// Payload of the batch currently being processed.
    pub batch: serde_json::Value,
    /// Outputs of the most recent forward stage.
    pub outputs: serde_json::Value,
    /// Loss value produced by the most recent loss stage.
    pub loss: Option<f64>,
    /// Metric values produced by the most recent metrics stage.
    pub metrics: HashMap<String, f64>,
}

// ---------------------------------------------------------------------------
// MeterBank — per-mode running averages
// ---------------------------------------------------------------------------

/// Running mean accumulator.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunningMean {
    sum: f64,
    count: u64,
}

impl RunningMean {
    pub fn push(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Replace the accumulated state with an externally aggregated mean.
    pub fn overwrite(&mut self, mean: f64) {
        self.sum = mean;
        self.count = 1;
    }
}

/// Per-mode running averages for loss and metric values.
#[derive(Debug, Clone, Default)]
pub struct MeterBank {
    scopes: HashMap<Mode, HashMap<String, RunningMean>>,
}

impl MeterBank {
    /// Drop all accumulators for `mode`. Called by meter-init stages at the
    /// start of each pass.
    pub fn reset(&mut self, mode: Mode) {
        self.scopes.remove(&mode);
    }

    /// Fold one observation into the accumulator for `key` under `mode`.
    pub fn push(&mut self, mode: Mode, key: &str, value: f64) {
        self.scopes
            .entry(mode)
            .or_default()
            .entry(key.to_owned())
            .or_default()
            .push(value);
    }

    /// Current means for `mode`, keyed with the mode's reporting prefix and
    /// sorted for stable display.
    pub fn means(&self, mode: Mode) -> BTreeMap<String, f64> {
        let prefix = mode.key_prefix();
        self.scopes
            .get(&mode)
            .map(|scope| {
                scope
                    .iter()
                    .filter_map(|(key, meter)| {
                        meter.mean().map(|m| (format!("{prefix}{key}"), m))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Raw unprefixed means for `mode`, the shape collective aggregation
    /// operates on.
    pub fn raw_means(&self, mode: Mode) -> HashMap<String, f64> {
        self.scopes
            .get(&mode)
            .map(|scope| {
                scope
                    .iter()
                    .filter_map(|(key, meter)| meter.mean().map(|m| (key.clone(), m)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Overwrite the accumulators for `mode` with aggregated means.
    pub fn apply_means(&mut self, mode: Mode, means: &HashMap<String, f64>) {
        let scope = self.scopes.entry(mode).or_default();
        for (key, mean) in means {
            scope.entry(key.clone()).or_default().overwrite(*mean);
        }
    }

    pub fn is_empty(&self, mode: Mode) -> bool {
        self.scopes.get(&mode).map_or(true, HashMap::is_empty)
    }
}

// ---------------------------------------------------------------------------
// DisplaySurface — live progress registration surface
// ---------------------------------------------------------------------------

/// A single live progress indicator attached by a wrapper entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressHandle {
    label: String,
    completed: u64,
    total: Option<u64>,
    summary: Option<String>,
}

impl ProgressHandle {
    pub fn new(label: impl Into<String>, total: Option<u64>) -> Self {
        Self {
            label: label.into(),
            completed: 0,
            total,
            summary: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Advance by `units`, saturating at the configured total.
    pub fn advance(&mut self, units: u64) {
        self.completed = self.completed.saturating_add(units);
        if let Some(total) = self.total {
            self.completed = self.completed.min(total);
        }
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }

    pub fn is_finished(&self) -> bool {
        self.total.is_some_and(|total| self.completed >= total)
    }

    /// Replace the live summary line rendered next to the bar.
    pub fn set_summary(&mut self, text: impl Into<String>) {
        self.summary = Some(text.into());
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }
}

/// LIFO stack of live progress handles.
///
/// Wrapper entries push on enter and pop on exit, so the innermost active
/// handle is always last and nesting mirrors the handler tree.
#[derive(Debug, Clone, Default)]
pub struct DisplaySurface {
    stack: Vec<ProgressHandle>,
}

impl DisplaySurface {
    pub fn attach(&mut self, handle: ProgressHandle) {
        self.stack.push(handle);
    }

    pub fn detach(&mut self) -> Option<ProgressHandle> {
        self.stack.pop()
    }

    /// The innermost active handle, if any.
    pub fn current_mut(&mut self) -> Option<&mut ProgressHandle> {
        self.stack.last_mut()
    }

    pub fn current(&self) -> Option<&ProgressHandle> {
        self.stack.last()
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Context — per-run state threaded through every handler invocation
// ---------------------------------------------------------------------------

/// Mutable state for one pipeline run.
///
/// A context is created per run and handed to every eligible handler body as
/// `&mut`. It is deliberately not shared: distributed execution gives each
/// rank its own context, and cross-rank agreement happens through collective
/// stages.
#[derive(Debug)]
pub struct Context {
    /// Correlation id for log lines belonging to this run.
    pub run_id: uuid::Uuid,
    /// This process's rank.
    pub rank: Rank,
    /// Number of cooperating processes.
    pub world_size: usize,
    pub mode: Mode,
    pub schedule: Schedule,
    pub step: StepState,
    pub meters: MeterBank,
    pub display: DisplaySurface,
    /// Batch payloads loaded by the dataset stage for the current mode.
    pub dataset: Vec<serde_json::Value>,
    values: HashMap<String, serde_json::Value>,
}

impl Context {
    pub fn new(rank: Rank, world_size: usize) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4(),
            rank,
            world_size: world_size.max(1),
            mode: Mode::Train,
            schedule: Schedule::default(),
            step: StepState::default(),
            meters: MeterBank::default(),
            display: DisplaySurface::default(),
            dataset: Vec::new(),
            values: HashMap::new(),
        }
    }

    /// Context for a plain single-process run.
    pub fn single_process() -> Self {
        Self::new(0, 1)
    }

    /// Insert or overwrite a scratch value.
    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.values.insert(key.into(), value);
    }

    /// Read a scratch value by key.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    /// Convenience accessor that returns a `String`. Falls back to `default`
    /// when the key is absent or not a JSON string.
    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.values
            .get(key)
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| default.to_owned())
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::single_process()
    }
}
