//! Node metadata: kinds, rank eligibility, stage bodies, and build specs.

use crate::signal::StageResult;
use crate::tree::NodeId;
use crate::wrapper::HandlerWrapper;
use flywheel_types::{Context, Rank};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// StageKind — explicit kind tag carried by every node
// ---------------------------------------------------------------------------

/// Kind tag checked by search, build-time rewrites, and profile labels.
///
/// Group kinds double as the dispatch policy for their children; everything
/// else is a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    // === Groups ===
    Sequence,
    EpochLoop,
    BatchLoop,

    // === Built-in stages ===
    Mode,
    Dataset,
    MeterInit,
    Forward,
    Loss,
    Backward,
    OptimStep,
    Metrics,
    Meter,
    GatherAverage,
    Report,
    LrDecay,

    /// Generic user-supplied work stage.
    Task,
}

impl StageKind {
    pub fn is_group(&self) -> bool {
        matches!(
            self,
            StageKind::Sequence | StageKind::EpochLoop | StageKind::BatchLoop
        )
    }

    /// Label used by profile walks and log lines.
    pub fn label(&self) -> &'static str {
        match self {
            StageKind::Sequence => "Sequence",
            StageKind::EpochLoop => "EpochLoop",
            StageKind::BatchLoop => "BatchLoop",
            StageKind::Mode => "Mode",
            StageKind::Dataset => "Dataset",
            StageKind::MeterInit => "MeterInit",
            StageKind::Forward => "Forward",
            StageKind::Loss => "Loss",
            StageKind::Backward => "Backward",
            StageKind::OptimStep => "OptimStep",
            StageKind::Metrics => "Metrics",
            StageKind::Meter => "Meter",
            StageKind::GatherAverage => "GatherAverage",
            StageKind::Report => "Report",
            StageKind::LrDecay => "LrDecay",
            StageKind::Task => "Task",
        }
    }
}

// ---------------------------------------------------------------------------
// ExecRanks — which ranks a node executes on
// ---------------------------------------------------------------------------

/// Rank eligibility carried by every node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecRanks {
    /// Execute on every rank.
    All,
    /// Defer to the nearest ancestor with an explicit restriction.
    #[default]
    Inherit,
    /// Execute only on the listed ranks.
    Only(Vec<Rank>),
}

impl ExecRanks {
    pub fn only(ranks: impl IntoIterator<Item = Rank>) -> Self {
        ExecRanks::Only(ranks.into_iter().collect())
    }

    /// Whether a node carrying this setting runs at `rank`, given the
    /// restriction `inherited` from its ancestors.
    pub fn allows(&self, rank: Rank, inherited: &ExecRanks) -> bool {
        match self {
            ExecRanks::All => true,
            ExecRanks::Only(ranks) => ranks.contains(&rank),
            ExecRanks::Inherit => match inherited {
                ExecRanks::Only(ranks) => ranks.contains(&rank),
                ExecRanks::All | ExecRanks::Inherit => true,
            },
        }
    }

    /// The restriction passed down to children: an explicit setting replaces
    /// whatever was inherited.
    pub fn pass_down<'a>(&'a self, inherited: &'a ExecRanks) -> &'a ExecRanks {
        match self {
            ExecRanks::Inherit => inherited,
            explicit => explicit,
        }
    }
}

// ---------------------------------------------------------------------------
// StageAction — executable body of a leaf node
// ---------------------------------------------------------------------------

/// Executable body of a leaf node.
///
/// Bodies are opaque to the engine: they read and mutate the run context and
/// answer with a [`Control`](crate::signal::Control) request. An error return
/// becomes a failure signal tagging the node.
pub trait StageAction: Send + Sync {
    fn execute(&self, ctx: &mut Context) -> StageResult;
}

/// Adapter turning a closure into a stage body.
pub struct FnStage<F>(F);

impl<F> FnStage<F>
where
    F: Fn(&mut Context) -> StageResult + Send + Sync,
{
    pub fn new(body: F) -> Self {
        Self(body)
    }
}

impl<F> StageAction for FnStage<F>
where
    F: Fn(&mut Context) -> StageResult + Send + Sync,
{
    fn execute(&self, ctx: &mut Context) -> StageResult {
        (self.0)(ctx)
    }
}

// ---------------------------------------------------------------------------
// NodeView — borrowed node metadata
// ---------------------------------------------------------------------------

/// Borrowed view of a node's metadata, handed to wrapper entries, search
/// predicates, and renderers.
#[derive(Debug, Clone, Copy)]
pub struct NodeView<'a> {
    pub handle: NodeId,
    pub id: &'a str,
    pub kind: StageKind,
    pub exec_ranks: &'a ExecRanks,
    /// Number of children; zero for leaves.
    pub child_count: usize,
}

// ---------------------------------------------------------------------------
// HandlerSpec — build-time description of a subtree
// ---------------------------------------------------------------------------

/// Build-time description of a node, materialized into a
/// [`HandlerTree`](crate::tree::HandlerTree).
///
/// Nodes without an explicit id get one minted from the builder's
/// [`IdFactory`](crate::build::IdFactory) during materialization.
pub struct HandlerSpec {
    pub(crate) id: Option<String>,
    pub(crate) kind: StageKind,
    pub(crate) exec_ranks: ExecRanks,
    pub(crate) payload: PayloadSpec,
    pub(crate) wrappers: Vec<Box<dyn HandlerWrapper>>,
}

/// Payload of a [`HandlerSpec`]: a leaf body or a nested group.
pub enum PayloadSpec {
    Leaf(Box<dyn StageAction>),
    Group(Vec<HandlerSpec>),
}

impl HandlerSpec {
    pub fn leaf(kind: StageKind, body: impl StageAction + 'static) -> Self {
        Self {
            id: None,
            kind,
            exec_ranks: ExecRanks::default(),
            payload: PayloadSpec::Leaf(Box::new(body)),
            wrappers: Vec::new(),
        }
    }

    pub fn group(kind: StageKind, children: Vec<HandlerSpec>) -> Self {
        Self {
            id: None,
            kind,
            exec_ranks: ExecRanks::default(),
            payload: PayloadSpec::Group(children),
            wrappers: Vec::new(),
        }
    }

    /// Plain single-pass group.
    pub fn sequence(children: Vec<HandlerSpec>) -> Self {
        Self::group(StageKind::Sequence, children)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_exec_ranks(mut self, ranks: ExecRanks) -> Self {
        self.exec_ranks = ranks;
        self
    }

    pub fn with_wrapper(mut self, wrapper: impl HandlerWrapper + 'static) -> Self {
        self.wrappers.push(Box::new(wrapper));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_kinds_are_groups() {
        assert!(StageKind::Sequence.is_group());
        assert!(StageKind::EpochLoop.is_group());
        assert!(StageKind::BatchLoop.is_group());
        assert!(!StageKind::Meter.is_group());
        assert!(!StageKind::Task.is_group());
    }

    #[test]
    fn exec_ranks_all_allows_everyone() {
        assert!(ExecRanks::All.allows(0, &ExecRanks::Inherit));
        assert!(ExecRanks::All.allows(7, &ExecRanks::only([1])));
    }

    #[test]
    fn exec_ranks_only_restricts() {
        let ranks = ExecRanks::only([1, 2]);
        assert!(!ranks.allows(0, &ExecRanks::All));
        assert!(ranks.allows(1, &ExecRanks::All));
        assert!(ranks.allows(2, &ExecRanks::only([0])));
    }

    #[test]
    fn exec_ranks_inherit_defers_to_ancestor() {
        let inherited = ExecRanks::only([1]);
        assert!(!ExecRanks::Inherit.allows(0, &inherited));
        assert!(ExecRanks::Inherit.allows(1, &inherited));
        // No ancestor restriction means everyone runs.
        assert!(ExecRanks::Inherit.allows(0, &ExecRanks::Inherit));
        assert!(ExecRanks::Inherit.allows(0, &ExecRanks::All));
    }

    #[test]
    fn pass_down_replaces_only_when_explicit() {
        let inherited = ExecRanks::only([3]);
        assert_eq!(
            ExecRanks::Inherit.pass_down(&inherited),
            &ExecRanks::only([3])
        );
        let own = ExecRanks::only([0]);
        assert_eq!(own.pass_down(&inherited), &ExecRanks::only([0]));
        assert_eq!(ExecRanks::All.pass_down(&inherited), &ExecRanks::All);
    }

    #[test]
    fn exec_ranks_serde_shape() {
        let json = serde_json::to_string(&ExecRanks::only([0, 2])).unwrap();
        assert_eq!(json, r#"{"only":[0,2]}"#);
        assert_eq!(serde_json::to_string(&ExecRanks::All).unwrap(), r#""all""#);
        let back: ExecRanks = serde_json::from_str(r#""inherit""#).unwrap();
        assert_eq!(back, ExecRanks::Inherit);
    }
}
