//! Two-phase wrapper chains around handler invocations.
//!
//! A wrapper injects setup/teardown behavior around a node without the node
//! knowing about it. Entries compose like scoped resources: enter callbacks
//! run in attachment order, exit callbacks in reverse, and exits run on
//! every path out of the body — normal completion and outward-travelling
//! signals alike.

use crate::node::{NodeView, StageKind};
use crate::signal::InvokeResult;
use flywheel_types::{Context, ProgressHandle};
use std::sync::Arc;

/// Two-phase middleware attached to a single node.
pub trait HandlerWrapper: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs before the node's body. Never skipped for an eligible node.
    fn on_enter(&self, node: NodeView<'_>, ctx: &mut Context);

    /// Runs after the node's body with the flow it produced, so entries can
    /// distinguish normal completion from a signal. Runs on every exit path.
    fn on_exit(&self, node: NodeView<'_>, ctx: &mut Context, flow: &InvokeResult);
}

/// Run `body` inside the node's wrapper chain.
pub(crate) fn run_chain(
    wrappers: &[Box<dyn HandlerWrapper>],
    node: NodeView<'_>,
    ctx: &mut Context,
    body: impl FnOnce(&mut Context) -> InvokeResult,
) -> InvokeResult {
    for entry in wrappers {
        tracing::trace!(node = %node.id, wrapper = entry.name(), "wrapper enter");
        entry.on_enter(node, ctx);
    }
    let flow = body(ctx);
    for entry in wrappers.iter().rev() {
        tracing::trace!(node = %node.id, wrapper = entry.name(), "wrapper exit");
        entry.on_exit(node, ctx, &flow);
    }
    flow
}

// ---------------------------------------------------------------------------
// Progress registration
// ---------------------------------------------------------------------------

/// Attaches a live progress handle for the wrapped node, advances it once on
/// normal completion, and always detaches it.
///
/// Enter/exit pairing keeps the display stack balanced, so at exit time the
/// innermost handle is the one this entry attached.
pub struct ProgressWrapper;

impl HandlerWrapper for ProgressWrapper {
    fn name(&self) -> &'static str {
        "progress"
    }

    fn on_enter(&self, node: NodeView<'_>, ctx: &mut Context) {
        let total = round_total(node.kind, ctx);
        ctx.display.attach(ProgressHandle::new(node.id, total));
    }

    fn on_exit(&self, node: NodeView<'_>, ctx: &mut Context, flow: &InvokeResult) {
        if flow.is_ok() {
            if let Some(handle) = ctx.display.current_mut() {
                handle.advance(1);
            }
        }
        match ctx.display.detach() {
            Some(handle) => {
                tracing::debug!(
                    node = %node.id,
                    completed = handle.completed(),
                    "progress detached"
                );
            }
            None => {
                tracing::warn!(node = %node.id, "progress handle already detached");
            }
        }
    }
}

/// Progress registration that also maintains a live meter summary rendered
/// by a [`Profiler`].
pub struct ProfileProgressWrapper {
    profiler: Arc<dyn Profiler>,
}

impl ProfileProgressWrapper {
    pub fn new(profiler: Arc<dyn Profiler>) -> Self {
        Self { profiler }
    }
}

impl HandlerWrapper for ProfileProgressWrapper {
    fn name(&self) -> &'static str {
        "profile_progress"
    }

    fn on_enter(&self, node: NodeView<'_>, ctx: &mut Context) {
        let total = round_total(node.kind, ctx);
        let mut handle = ProgressHandle::new(node.id, total);
        handle.set_summary(self.profiler.meter_profile(ctx));
        ctx.display.attach(handle);
    }

    fn on_exit(&self, node: NodeView<'_>, ctx: &mut Context, flow: &InvokeResult) {
        if flow.is_ok() {
            let summary = self.profiler.meter_profile(ctx);
            if let Some(handle) = ctx.display.current_mut() {
                handle.advance(1);
                handle.set_summary(summary);
            }
        }
        if ctx.display.detach().is_none() {
            tracing::warn!(node = %node.id, "progress handle already detached");
        }
    }
}

/// Round total for the wrapped node, when the context knows it up front.
fn round_total(kind: StageKind, ctx: &Context) -> Option<u64> {
    match kind {
        StageKind::EpochLoop => Some(ctx.schedule.total_epochs as u64),
        StageKind::BatchLoop => Some(ctx.dataset.len() as u64),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Profiler — live textual summaries
// ---------------------------------------------------------------------------

/// Renders a short textual summary of the run's current state. Must be
/// side-effect-free: profiles may be taken at any point of a run.
pub trait Profiler: Send + Sync {
    fn meter_profile(&self, ctx: &Context) -> String;
}

/// Default profiler: the current meter means for the active mode.
pub struct MeterProfiler;

impl Profiler for MeterProfiler {
    fn meter_profile(&self, ctx: &Context) -> String {
        let means = ctx.meters.means(ctx.mode);
        if means.is_empty() {
            return "(no meters)".to_owned();
        }
        means
            .iter()
            .map(|(key, value)| format!("{key}: {value:.6}"))
            .collect::<Vec<_>>()
            .join(" | ")
    }
}
