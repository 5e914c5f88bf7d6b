//! Control-flow signals returned by handler invocations.
//!
//! Signals are ordinary values, not unwinding: every invocation returns an
//! [`InvokeResult`] and enclosing groups pattern-match on the tag to decide
//! whether to keep dispatching. `Continue` and `Break` never leave the tree;
//! `Terminate` and `Failure` travel all the way to [`run`](crate::engine::run),
//! which maps them into the public error type.

use crate::tree::NodeId;
use serde::{Deserialize, Serialize};

/// Non-normal outcome of invoking a handler node.
#[derive(Debug)]
pub enum Signal {
    /// Skip the remaining handlers of the current group round.
    ///
    /// Absorbed by the dispatch loop of the nearest enclosing group, which
    /// then finishes the round normally.
    Continue,

    /// Abort the nearest enclosing group entirely.
    ///
    /// Travels past the group's wrapper chain and is absorbed by the group's
    /// own invocation frame, one level above the dispatch loop.
    Break,

    /// Abort the whole run.
    ///
    /// `origin` is stamped by the first invocation frame that observes it
    /// unset — the node whose body requested the abort — and is never
    /// overwritten on the way out.
    Terminate { origin: Option<NodeId> },

    /// A handler body failed with an arbitrary error.
    ///
    /// Created in place of the raw error at the failing node, so every outer
    /// frame (and the caller) knows which node to blame.
    Failure { node: NodeId, source: anyhow::Error },
}

impl Signal {
    /// Short tag for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Continue => "continue",
            Signal::Break => "break",
            Signal::Terminate { .. } => "terminate",
            Signal::Failure { .. } => "failure",
        }
    }

    /// Fold a stage body result into the signal layer, tagging failures with
    /// the node that produced them.
    pub fn from_stage(node: NodeId, result: StageResult) -> InvokeResult {
        match result {
            Ok(Control::Advance) => Ok(()),
            Ok(Control::Continue) => Err(Signal::Continue),
            Ok(Control::Break) => Err(Signal::Break),
            Ok(Control::Terminate) => Err(Signal::Terminate { origin: None }),
            Err(source) => Err(Signal::Failure { node, source }),
        }
    }
}

/// Result of invoking a node: `Ok` is normal completion, `Err` carries the
/// signal still travelling outwards.
pub type InvokeResult = std::result::Result<(), Signal>;

/// What a stage body asks the dispatcher to do after it returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Control {
    /// Proceed to the next handler of the enclosing group.
    #[default]
    Advance,
    /// Skip the remaining handlers of the enclosing group round.
    Continue,
    /// Abort the enclosing group.
    Break,
    /// Abort the whole run.
    Terminate,
}

/// Result type returned by stage bodies.
pub type StageResult = std::result::Result<Control, anyhow::Error>;
