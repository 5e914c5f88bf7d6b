//! Read-only tree inspection: finders, rank resolution, and a breadth-first
//! profile walk used by reporting surfaces.
//!
//! Everything here takes `&HandlerTree` and never mutates. The finders scan
//! in document order (depth-first, parents before children) so "first match"
//! has a stable meaning across runs.

use crate::node::{ExecRanks, NodeView, StageKind};
use crate::tree::{HandlerTree, NodeId};
use serde_json::Value;
use std::collections::VecDeque;

// ---------------------------------------------------------------------------
// Finders
// ---------------------------------------------------------------------------

impl HandlerTree {
    /// Find the first handler carrying `id`, in document order.
    ///
    /// Ids are not enforced unique. When several handlers share one, the
    /// first match wins and a single warning names the collision.
    pub fn find_by_id(&self, id: &str) -> Option<NodeId> {
        let mut first = None;
        let mut matches = 0usize;
        self.walk_preorder(|view| {
            if view.id == id {
                matches += 1;
                if first.is_none() {
                    first = Some(view.handle);
                }
            }
        });
        if matches > 1 {
            tracing::warn!(
                id,
                matches,
                "multiple handlers share this id; using the first in tree order"
            );
        }
        first
    }

    /// All handlers of `kind`, in document order.
    pub fn find_by_kind(&self, kind: StageKind) -> Vec<NodeId> {
        self.find_by_predicate(|view| view.kind == kind)
    }

    /// All handlers whose kind appears in `kinds`, in document order.
    pub fn find_by_kinds(&self, kinds: &[StageKind]) -> Vec<NodeId> {
        self.find_by_predicate(|view| kinds.contains(&view.kind))
    }

    /// All handlers matching `pred`, in document order.
    pub fn find_by_predicate(&self, pred: impl Fn(NodeView<'_>) -> bool) -> Vec<NodeId> {
        let mut found = Vec::new();
        self.walk_preorder(|view| {
            if pred(view) {
                found.push(view.handle);
            }
        });
        found
    }

    /// Resolve the rank set a node would run under, walking ancestors until
    /// an explicit restriction is found. A fully `inherit` chain resolves to
    /// [`ExecRanks::All`]. `None` when the handle is stale.
    ///
    /// Dispatch computes the same answer top-down while it descends; this is
    /// the bottom-up view for inspection.
    pub fn effective_ranks(&self, node: NodeId) -> Option<ExecRanks> {
        if !self.contains(node) {
            return None;
        }
        let mut current = Some(node);
        while let Some(handle) = current {
            match self.exec_ranks_of(handle) {
                Some(ExecRanks::Inherit) | None => current = self.parent_of(handle),
                Some(explicit) => return Some(explicit.clone()),
            }
        }
        Some(ExecRanks::All)
    }

    fn walk_preorder(&self, mut visit: impl FnMut(NodeView<'_>)) {
        let mut stack = vec![self.root()];
        while let Some(node) = stack.pop() {
            let Some(view) = self.view(node) else { continue };
            visit(view);
            for &child in self.children_of(node).iter().rev() {
                stack.push(child);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Profile walk
// ---------------------------------------------------------------------------

/// One row of a structural profile: enough to render a tree listing or feed
/// a reporting sink without touching node payloads.
#[derive(Debug, Clone)]
pub struct ProfileRow {
    pub node: NodeId,
    pub parent: Option<NodeId>,
    pub depth: usize,
    /// Human-facing kind label, e.g. `EpochLoop`.
    pub label: String,
    /// Structural attributes: id, kind, exec_ranks, and child count for groups.
    pub attrs: serde_json::Map<String, Value>,
}

/// Lazy breadth-first iterator over [`ProfileRow`]s, root first.
pub struct ProfileWalk<'a> {
    tree: &'a HandlerTree,
    queue: VecDeque<(NodeId, usize)>,
}

impl HandlerTree {
    /// Walk the tree breadth-first, yielding one [`ProfileRow`] per live node.
    pub fn profile_walk(&self) -> ProfileWalk<'_> {
        let mut queue = VecDeque::new();
        queue.push_back((self.root(), 0));
        ProfileWalk { tree: self, queue }
    }
}

impl<'a> Iterator for ProfileWalk<'a> {
    type Item = ProfileRow;

    fn next(&mut self) -> Option<ProfileRow> {
        loop {
            let (node, depth) = self.queue.pop_front()?;
            let Some(view) = self.tree.view(node) else {
                continue;
            };
            for &child in self.tree.children_of(node) {
                self.queue.push_back((child, depth + 1));
            }

            let mut attrs = serde_json::Map::new();
            attrs.insert("id".into(), Value::String(view.id.to_owned()));
            attrs.insert(
                "kind".into(),
                serde_json::to_value(view.kind).unwrap_or(Value::Null),
            );
            attrs.insert(
                "exec_ranks".into(),
                serde_json::to_value(view.exec_ranks).unwrap_or(Value::Null),
            );
            if view.kind.is_group() {
                attrs.insert("children".into(), Value::from(view.child_count));
            }

            return Some(ProfileRow {
                node,
                parent: self.tree.parent_of(node),
                depth,
                label: view.kind.label().to_owned(),
                attrs,
            });
        }
    }
}
