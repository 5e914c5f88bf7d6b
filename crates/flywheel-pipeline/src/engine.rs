//! Depth-first dispatch with structured control-flow signals.
//!
//! Every invocation goes through the same layers, innermost last:
//!
//! 1. eligibility gate — an ineligible node is a complete no-op;
//! 2. wrapper chain — enter in order, exit in reverse, exits always run;
//! 3. payload — a leaf body, or one or more dispatch rounds for a group;
//! 4. classification — a fresh `Terminate` is stamped with its origin, and a
//!    `Break` coming out of a group's own dispatch loop is absorbed here.
//!
//! `Continue` never reaches classification: the dispatch loop of the nearest
//! enclosing group absorbs it mid-round, which is why a group's wrappers see
//! normal completion for `Continue` but observe `Break` passing through.

use crate::node::{ExecRanks, StageKind};
use crate::signal::{InvokeResult, Signal};
use crate::tree::{HandlerTree, NodeId};
use crate::wrapper;
use flywheel_types::{Context, FlywheelError, Result};
use std::time::Instant;

/// Summary of a completed run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: uuid::Uuid,
    /// Invocations that passed the eligibility gate.
    pub invoked: usize,
    /// Invocations skipped by rank gating.
    pub skipped: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Default)]
struct RunStats {
    invoked: usize,
    skipped: usize,
}

/// Execute the tree from its root against `ctx`.
///
/// Normal completion returns a [`RunReport`]. A `Terminate` or `Failure`
/// signal reaching the root surfaces as the corresponding error; `Continue`
/// or `Break` escaping a leaf-only root counts as completion, since there is
/// no enclosing group left to cut short.
pub fn run(tree: &HandlerTree, ctx: &mut Context) -> Result<RunReport> {
    let started = Instant::now();
    let root = tree.root();
    tracing::info!(
        run_id = %ctx.run_id,
        rank = ctx.rank,
        root = tree.id_of(root).unwrap_or("<stale>"),
        "pipeline run starting"
    );

    let mut stats = RunStats::default();
    let flow = invoke(tree, root, ctx, &ExecRanks::All, &mut stats);
    let report = RunReport {
        run_id: ctx.run_id,
        invoked: stats.invoked,
        skipped: stats.skipped,
        duration_ms: started.elapsed().as_millis() as u64,
    };

    match flow {
        Ok(()) => {
            tracing::info!(
                run_id = %ctx.run_id,
                invoked = report.invoked,
                skipped = report.skipped,
                duration_ms = report.duration_ms,
                "pipeline run complete"
            );
            Ok(report)
        }
        Err(Signal::Continue) | Err(Signal::Break) => {
            tracing::debug!(run_id = %ctx.run_id, "group signal escaped a leaf-only root; run complete");
            Ok(report)
        }
        Err(Signal::Terminate { origin }) => {
            let origin = origin
                .and_then(|node| tree.id_of(node))
                .unwrap_or("<unknown>")
                .to_owned();
            Err(FlywheelError::Terminated { origin })
        }
        Err(Signal::Failure { node, source }) => Err(FlywheelError::StageFailed {
            node: tree.id_of(node).unwrap_or("<unknown>").to_owned(),
            source,
        }),
    }
}

fn invoke(
    tree: &HandlerTree,
    node: NodeId,
    ctx: &mut Context,
    inherited: &ExecRanks,
    stats: &mut RunStats,
) -> InvokeResult {
    let Some(view) = tree.view(node) else {
        return Err(Signal::Failure {
            node,
            source: anyhow::anyhow!("dispatch reached a stale node handle"),
        });
    };

    if !view.exec_ranks.allows(ctx.rank, inherited) {
        tracing::debug!(node = %view.id, rank = ctx.rank, "handler not eligible on this rank; skipping");
        stats.skipped += 1;
        return Ok(());
    }
    stats.invoked += 1;
    tracing::debug!(node = %view.id, kind = view.kind.label(), "invoking handler");

    let effective = view.exec_ranks.pass_down(inherited);
    let flow = wrapper::run_chain(tree.wrappers_of(node), view, ctx, |ctx| {
        execute_payload(tree, node, ctx, effective, stats)
    });

    match flow {
        Err(Signal::Terminate { origin: None }) => {
            tracing::debug!(node = %view.id, "terminate raised here");
            Err(Signal::Terminate { origin: Some(node) })
        }
        Err(Signal::Break) if view.kind.is_group() => {
            tracing::debug!(node = %view.id, "break absorbed by its group");
            Ok(())
        }
        other => other,
    }
}

fn execute_payload(
    tree: &HandlerTree,
    node: NodeId,
    ctx: &mut Context,
    effective: &ExecRanks,
    stats: &mut RunStats,
) -> InvokeResult {
    if tree.is_group(node) {
        dispatch_rounds(tree, node, ctx, effective, stats)
    } else {
        match tree.body_of(node) {
            Some(body) => Signal::from_stage(node, body.execute(ctx)),
            None => Ok(()),
        }
    }
}

/// Run the group's children for as many rounds as its kind prescribes.
///
/// `Continue` ends the current round; everything else cuts the loop and
/// travels outward (where the group's invocation frame absorbs a `Break`).
fn dispatch_rounds(
    tree: &HandlerTree,
    group: NodeId,
    ctx: &mut Context,
    effective: &ExecRanks,
    stats: &mut RunStats,
) -> InvokeResult {
    match tree.kind_of(group) {
        Some(StageKind::EpochLoop) => {
            let total = ctx.schedule.total_epochs;
            for epoch in 0..total {
                ctx.schedule.current_epoch = epoch;
                tracing::debug!(
                    group = tree.id_of(group).unwrap_or("<stale>"),
                    epoch,
                    total,
                    "epoch round starting"
                );
                dispatch_round(tree, group, ctx, effective, stats)?;
                advance_progress(tree, group, ctx);
            }
            Ok(())
        }
        Some(StageKind::BatchLoop) => {
            let total = ctx.dataset.len();
            ctx.step.total = total;
            for index in 0..total {
                let Some(batch) = ctx.dataset.get(index).cloned() else {
                    break;
                };
                ctx.step.index = index;
                ctx.step.batch = batch;
                dispatch_round(tree, group, ctx, effective, stats)?;
                advance_progress(tree, group, ctx);
            }
            Ok(())
        }
        _ => dispatch_round(tree, group, ctx, effective, stats),
    }
}

fn dispatch_round(
    tree: &HandlerTree,
    group: NodeId,
    ctx: &mut Context,
    effective: &ExecRanks,
    stats: &mut RunStats,
) -> InvokeResult {
    for &child in tree.children_of(group) {
        match invoke(tree, child, ctx, effective, stats) {
            Ok(()) => {}
            Err(Signal::Continue) => {
                tracing::debug!(
                    group = tree.id_of(group).unwrap_or("<stale>"),
                    "continue absorbed; round cut short"
                );
                break;
            }
            Err(signal) => return Err(signal),
        }
    }
    Ok(())
}

/// Loop rounds drive the progress handle the group's own wrapper attached,
/// when there is one. Handles attached for other nodes are left alone.
fn advance_progress(tree: &HandlerTree, group: NodeId, ctx: &mut Context) {
    let Some(id) = tree.id_of(group) else { return };
    if let Some(handle) = ctx.display.current_mut() {
        if handle.label() == id {
            handle.advance(1);
        }
    }
}
