//! Launch modes and the distributed tree rewrite.
//!
//! A distributed run executes the same tree on every rank; the only build-time
//! difference is that each running-average node gains a gather stage directly
//! in front of it, so the averages seen by reporting are cross-rank means.

use crate::build::IdFactory;
use crate::node::{ExecRanks, HandlerSpec, StageKind};
use crate::stages::{Collective, GatherAverageStage};
use crate::tree::HandlerTree;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How the pipeline is being launched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    #[default]
    Vanilla,
    Distributed,
}

/// Insert a [`StageKind::GatherAverage`] node immediately before every
/// [`StageKind::Meter`] node in the tree, returning how many were inserted.
///
/// The gather node's id is `gather_average_{suffix}` where the suffix is the
/// final `_`-separated segment of the meter's id, and it runs on all ranks
/// regardless of what the meter inherits. A tree without meters is left
/// untouched.
pub fn apply_distributed_rewrite(
    tree: &mut HandlerTree,
    collective: &Arc<dyn Collective>,
    ids: &mut IdFactory,
) -> usize {
    let mut inserted = 0;
    for meter in tree.find_by_kind(StageKind::Meter) {
        let Some(meter_id) = tree.id_of(meter).map(str::to_owned) else {
            continue;
        };
        let suffix = meter_id.rsplit('_').next().unwrap_or(&meter_id);
        let gather_id = format!("gather_average_{suffix}");
        let spec = HandlerSpec::leaf(
            StageKind::GatherAverage,
            GatherAverageStage::new(collective.clone()),
        )
        .with_id(gather_id.clone())
        .with_exec_ranks(ExecRanks::All);

        let gather = tree.create(spec, ids);
        if tree.insert_before(meter, gather) {
            inserted += 1;
            tracing::debug!(meter = %meter_id, gather = %gather_id, "gather stage inserted");
        } else {
            // insert_before already warned; drop the orphaned node.
            let _ = tree.discard(gather);
        }
    }
    if inserted > 0 {
        tracing::info!(inserted, "distributed rewrite complete");
    }
    inserted
}
