//! Handler-tree pipeline runner: construction, dispatch, and rewriting.
//!
//! This crate implements the core Flywheel pipeline: the handler composite
//! tree with its mutation primitives, depth-first dispatch under the
//! Continue/Break/Terminate/Failure signal model, two-phase wrapper chains,
//! tree search and profiling walks, the standard train/eval/predict
//! builders, and the distributed gather rewrite.

pub mod build;
pub mod engine;
pub mod launch;
pub mod node;
pub mod query;
pub mod signal;
pub mod stages;
pub mod tree;
pub mod wrapper;

pub use build::{IdFactory, PipelineBuilder};
pub use engine::{run, RunReport};
pub use launch::{apply_distributed_rewrite, LaunchMode};
pub use node::{ExecRanks, FnStage, HandlerSpec, NodeView, StageAction, StageKind};
pub use query::{ProfileRow, ProfileWalk};
pub use signal::{Control, InvokeResult, Signal, StageResult};
pub use stages::{
    BackwardStage, Collective, DataProvider, DatasetStage, ForwardStage, GatherAverageStage,
    LossStage, LrDecayStage, MeterInitStage, MeterStage, MetricsStage, ModeStage, OptimStepStage,
    ReportStage, StepDriver,
};
pub use tree::{HandlerTree, NodeId};
pub use wrapper::{
    HandlerWrapper, MeterProfiler, ProfileProgressWrapper, Profiler, ProgressWrapper,
};
