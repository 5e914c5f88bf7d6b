//! Arena-backed handler tree with generation-checked handles.
//!
//! The tree owns every node. A [`NodeId`] is an index plus a generation
//! counter, so a handle to a discarded node is detectably stale instead of
//! silently pointing at a reused slot. Parent back-references are handles too
//! and are maintained exclusively by the sequence-mutation primitives, which
//! keeps the membership invariant in one place: a node has exactly one parent
//! while attached, none once detached, and is never listed by two groups at
//! once.

use crate::build::IdFactory;
use crate::node::{ExecRanks, HandlerSpec, NodeView, PayloadSpec, StageAction, StageKind};
use crate::wrapper::HandlerWrapper;
use flywheel_types::{FlywheelError, Result};
use std::ops::Range;

/// Generation-checked handle to a node owned by a [`HandlerTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

pub(crate) enum Payload {
    Leaf(Box<dyn StageAction>),
    Group(Vec<NodeId>),
}

pub(crate) struct Node {
    pub(crate) id: String,
    pub(crate) kind: StageKind,
    pub(crate) exec_ranks: ExecRanks,
    pub(crate) parent: Option<NodeId>,
    pub(crate) payload: Payload,
    pub(crate) wrappers: Vec<Box<dyn HandlerWrapper>>,
}

impl Node {
    fn children(&self) -> &[NodeId] {
        match &self.payload {
            Payload::Group(children) => children,
            Payload::Leaf(_) => &[],
        }
    }
}

struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// Arena owning one handler tree: the root plus any temporarily detached
/// subtrees awaiting reinsertion or discard.
pub struct HandlerTree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    root: NodeId,
}

impl HandlerTree {
    /// Materialize a spec tree, minting ids from `ids` where unspecified.
    pub fn materialize(spec: HandlerSpec, ids: &mut IdFactory) -> Self {
        let mut tree = Self {
            slots: Vec::new(),
            free: Vec::new(),
            root: NodeId {
                index: 0,
                generation: 0,
            },
        };
        tree.root = tree.insert_spec(spec, None, ids);
        tree
    }

    /// Materialize `spec` as a detached subtree inside this arena.
    ///
    /// The returned handle has no parent until one of the mutation
    /// operations attaches it.
    pub fn create(&mut self, spec: HandlerSpec, ids: &mut IdFactory) -> NodeId {
        self.insert_spec(spec, None, ids)
    }

    fn insert_spec(
        &mut self,
        spec: HandlerSpec,
        parent: Option<NodeId>,
        ids: &mut IdFactory,
    ) -> NodeId {
        let id = spec.id.unwrap_or_else(|| ids.next_id());
        match spec.payload {
            PayloadSpec::Leaf(body) => self.alloc(Node {
                id,
                kind: spec.kind,
                exec_ranks: spec.exec_ranks,
                parent,
                payload: Payload::Leaf(body),
                wrappers: spec.wrappers,
            }),
            PayloadSpec::Group(child_specs) => {
                let group = self.alloc(Node {
                    id,
                    kind: spec.kind,
                    exec_ranks: spec.exec_ranks,
                    parent,
                    payload: Payload::Group(Vec::with_capacity(child_specs.len())),
                    wrappers: spec.wrappers,
                });
                for child_spec in child_specs {
                    let child = self.insert_spec(child_spec, Some(group), ids);
                    if let Some(node) = self.node_mut(group) {
                        if let Payload::Group(children) = &mut node.payload {
                            children.push(child);
                        }
                    }
                }
                group
            }
        }
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            NodeId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                node: Some(node),
            });
            NodeId {
                index,
                generation: 0,
            }
        }
    }

    fn node(&self, id: NodeId) -> Option<&Node> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Whether `node` is still alive in this arena.
    pub fn contains(&self, node: NodeId) -> bool {
        self.node(node).is_some()
    }

    /// Number of live nodes, attached or not.
    pub fn node_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.node.is_some()).count()
    }

    pub fn id_of(&self, node: NodeId) -> Option<&str> {
        self.node(node).map(|n| n.id.as_str())
    }

    pub fn kind_of(&self, node: NodeId) -> Option<StageKind> {
        self.node(node).map(|n| n.kind)
    }

    pub fn exec_ranks_of(&self, node: NodeId) -> Option<&ExecRanks> {
        self.node(node).map(|n| &n.exec_ranks)
    }

    pub fn parent_of(&self, node: NodeId) -> Option<NodeId> {
        self.node(node).and_then(|n| n.parent)
    }

    pub fn children_of(&self, node: NodeId) -> &[NodeId] {
        self.node(node).map(Node::children).unwrap_or(&[])
    }

    pub fn is_group(&self, node: NodeId) -> bool {
        self.node(node)
            .map(|n| matches!(n.payload, Payload::Group(_)))
            .unwrap_or(false)
    }

    pub fn view(&self, node: NodeId) -> Option<NodeView<'_>> {
        self.node(node).map(|n| NodeView {
            handle: node,
            id: &n.id,
            kind: n.kind,
            exec_ranks: &n.exec_ranks,
            child_count: n.children().len(),
        })
    }

    pub(crate) fn body_of(&self, node: NodeId) -> Option<&dyn StageAction> {
        match &self.node(node)?.payload {
            Payload::Leaf(body) => Some(body.as_ref()),
            Payload::Group(_) => None,
        }
    }

    pub(crate) fn wrappers_of(&self, node: NodeId) -> &[Box<dyn HandlerWrapper>] {
        self.node(node)
            .map(|n| n.wrappers.as_slice())
            .unwrap_or(&[])
    }

    /// Id string for error messages; survives stale handles.
    fn label(&self, node: NodeId) -> String {
        self.id_of(node).unwrap_or("<stale>").to_owned()
    }

    // -----------------------------------------------------------------------
    // Sequence mutation primitives
    //
    // All of these keep the parent invariant inside the same call: the
    // membership change and the back-reference change are never observable
    // separately.
    // -----------------------------------------------------------------------

    /// Append `node` to the end of `group`'s sequence.
    pub fn push_child(&mut self, group: NodeId, node: NodeId) -> Result<()> {
        let len = self.children_of(group).len();
        self.insert_at(group, len, node)
    }

    /// Insert `node` at `index`, shifting later children right. `index` may
    /// equal the current length (append).
    pub fn insert_at(&mut self, group: NodeId, index: usize, node: NodeId) -> Result<()> {
        self.ensure_group(group)?;
        let len = self.children_of(group).len();
        if index > len {
            return Err(FlywheelError::IndexOutOfBounds {
                container: self.label(group),
                index,
                len,
            });
        }
        self.ensure_insertable(group, node)?;
        if let Some(children) = self.children_mut(group) {
            children.insert(index, node);
        }
        if let Some(n) = self.node_mut(node) {
            n.parent = Some(group);
        }
        Ok(())
    }

    /// Replace the child at `index` with `node`, returning the detached
    /// previous occupant.
    pub fn set_at(&mut self, group: NodeId, index: usize, node: NodeId) -> Result<NodeId> {
        self.ensure_group(group)?;
        let len = self.children_of(group).len();
        if index >= len {
            return Err(FlywheelError::IndexOutOfBounds {
                container: self.label(group),
                index,
                len,
            });
        }
        self.ensure_insertable(group, node)?;
        let mut old = node;
        if let Some(children) = self.children_mut(group) {
            old = children[index];
            children[index] = node;
        }
        if let Some(n) = self.node_mut(old) {
            n.parent = None;
        }
        if let Some(n) = self.node_mut(node) {
            n.parent = Some(group);
        }
        Ok(old)
    }

    /// Remove and return the child at `index`, leaving it alive but
    /// detached.
    pub fn delete_at(&mut self, group: NodeId, index: usize) -> Result<NodeId> {
        self.ensure_group(group)?;
        let len = self.children_of(group).len();
        if index >= len {
            return Err(FlywheelError::IndexOutOfBounds {
                container: self.label(group),
                index,
                len,
            });
        }
        let mut old = group;
        if let Some(children) = self.children_mut(group) {
            old = children.remove(index);
        }
        if let Some(n) = self.node_mut(old) {
            n.parent = None;
        }
        Ok(old)
    }

    /// Replace the children in `range` with `nodes` (the sequences may have
    /// different lengths), returning the detached previous occupants.
    ///
    /// Validation is all-or-nothing: if any replacement is unusable the
    /// sequence is left untouched.
    pub fn splice(
        &mut self,
        group: NodeId,
        range: Range<usize>,
        nodes: Vec<NodeId>,
    ) -> Result<Vec<NodeId>> {
        self.ensure_group(group)?;
        let len = self.children_of(group).len();
        if range.start > range.end || range.end > len {
            return Err(FlywheelError::InvalidRange {
                container: self.label(group),
                start: range.start,
                end: range.end,
                len,
            });
        }
        for (position, &node) in nodes.iter().enumerate() {
            self.ensure_insertable(group, node)?;
            if nodes[..position].contains(&node) {
                return Err(FlywheelError::AlreadyAttached {
                    node: self.label(node),
                    parent: self.label(group),
                });
            }
        }
        let mut replaced = Vec::new();
        if let Some(children) = self.children_mut(group) {
            replaced = children.splice(range, nodes.iter().copied()).collect();
        }
        for &old in &replaced {
            if let Some(n) = self.node_mut(old) {
                n.parent = None;
            }
        }
        for &new in &nodes {
            if let Some(n) = self.node_mut(new) {
                n.parent = Some(group);
            }
        }
        Ok(replaced)
    }

    /// Remove and return the children in `range`, leaving them alive but
    /// detached.
    pub fn delete_range(&mut self, group: NodeId, range: Range<usize>) -> Result<Vec<NodeId>> {
        self.splice(group, range, Vec::new())
    }

    fn children_mut(&mut self, group: NodeId) -> Option<&mut Vec<NodeId>> {
        match &mut self.node_mut(group)?.payload {
            Payload::Group(children) => Some(children),
            Payload::Leaf(_) => None,
        }
    }

    fn ensure_group(&self, group: NodeId) -> Result<()> {
        let node = self.node(group).ok_or(FlywheelError::StaleHandle)?;
        match node.payload {
            Payload::Group(_) => Ok(()),
            Payload::Leaf(_) => Err(FlywheelError::NotAGroup {
                node: node.id.clone(),
            }),
        }
    }

    fn ensure_insertable(&self, group: NodeId, node: NodeId) -> Result<()> {
        let n = self.node(node).ok_or(FlywheelError::StaleHandle)?;
        if let Some(parent) = n.parent {
            return Err(FlywheelError::AlreadyAttached {
                node: n.id.clone(),
                parent: self.label(parent),
            });
        }
        // Walking up from the target group catches attempts to attach a node
        // above itself.
        let mut cursor = Some(group);
        while let Some(current) = cursor {
            if current == node {
                return Err(FlywheelError::WouldCycle { node: n.id.clone() });
            }
            cursor = self.parent_of(current);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Structural operations
    //
    // Convenience operations phrased from the node's own point of view. They
    // fail soft: a node whose back-reference no longer holds logs a warning,
    // has the stale reference cleared, and reports `false`.
    // -----------------------------------------------------------------------

    /// Swap `replacement` into this node's position. The node itself is left
    /// alive and detached.
    pub fn replace_with(&mut self, node: NodeId, replacement: NodeId) -> bool {
        let Some((parent, index)) = self.verify_parent(node) else {
            return false;
        };
        match self.set_at(parent, index, replacement) {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(error = %err, "replace_with rejected");
                false
            }
        }
    }

    /// Insert `new_node` as the sibling immediately before this node.
    pub fn insert_before(&mut self, node: NodeId, new_node: NodeId) -> bool {
        let Some((parent, index)) = self.verify_parent(node) else {
            return false;
        };
        match self.insert_at(parent, index, new_node) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(error = %err, "insert_before rejected");
                false
            }
        }
    }

    /// Insert `new_node` as the sibling immediately after this node.
    pub fn insert_after(&mut self, node: NodeId, new_node: NodeId) -> bool {
        let Some((parent, index)) = self.verify_parent(node) else {
            return false;
        };
        match self.insert_at(parent, index + 1, new_node) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(error = %err, "insert_after rejected");
                false
            }
        }
    }

    /// Remove this node from its group, leaving it alive and detached.
    pub fn detach(&mut self, node: NodeId) -> bool {
        let Some((parent, index)) = self.verify_parent(node) else {
            return false;
        };
        match self.delete_at(parent, index) {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(error = %err, "detach rejected");
                false
            }
        }
    }

    /// Confirm the node's parent back-reference still points at a live group
    /// that lists it, returning the parent and the node's position. Clears
    /// the reference and warns when it no longer holds.
    fn verify_parent(&mut self, node: NodeId) -> Option<(NodeId, usize)> {
        let (label, parent) = match self.node(node) {
            Some(n) => (n.id.clone(), n.parent),
            None => {
                tracing::warn!(handle = ?node, "structural operation on a stale handle; ignoring");
                return None;
            }
        };
        let Some(parent) = parent else {
            tracing::warn!(node = %label, "structural operation on a detached node; ignoring");
            return None;
        };
        let position = self
            .node(parent)
            .and_then(|p| p.children().iter().position(|&child| child == node));
        match position {
            Some(index) => Some((parent, index)),
            None => {
                tracing::warn!(node = %label, "parent back-reference is stale; clearing it");
                if let Some(n) = self.node_mut(node) {
                    n.parent = None;
                }
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Free `node` and its whole subtree, bumping slot generations so every
    /// existing handle to the freed nodes reads as stale. An attached node is
    /// detached from its group first.
    ///
    /// Returns the number of nodes freed. Discarding the root leaves the
    /// tree permanently stale; callers are expected to discard only replaced
    /// or detached subtrees.
    pub fn discard(&mut self, node: NodeId) -> Result<usize> {
        if !self.contains(node) {
            return Err(FlywheelError::StaleHandle);
        }
        if self.parent_of(node).is_some() {
            self.detach(node);
        }
        let mut freed = 0;
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            let Some(slot) = self.slots.get_mut(current.index as usize) else {
                continue;
            };
            if slot.generation != current.generation {
                continue;
            }
            if let Some(freed_node) = slot.node.take() {
                slot.generation += 1;
                stack.extend(freed_node.children().iter().copied());
                self.free.push(current.index);
                freed += 1;
            }
        }
        Ok(freed)
    }
}
