// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The state tree: an arena of [`StateNode`]s addressed by [`NodeId`].
//!
//! # Structural Invariants
//!
//! - The parent/child graph is a finite rooted tree.
//! - A node is attached iff it is reachable from the root.
//! - Detaching a node detaches its entire subtree; detached nodes stay
//!   addressable by id until [`StateTree::purge_detached`] so that a batch can
//!   detach and re-attach a node (a move).
//! - Ids are never reused. Ids introduced by received diffs bump the counter.
//!
//! Traversal for anything needing deterministic order is depth-first pre-order.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::change::NodeChange;
use super::node::{FeatureKind, FeatureValue, NodeId, StateNode};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("invalid parent {0}: node is not attached")]
    InvalidParent(NodeId),
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    #[error("node {0} is already attached")]
    AlreadyAttached(NodeId),
    #[error("the root node cannot be detached or re-attached")]
    RootNode,
    #[error("feature '{feature}' on node {node} is a {actual}, expected a {expected}")]
    FeatureTypeMismatch {
        node: NodeId,
        feature: String,
        expected: FeatureKind,
        actual: FeatureKind,
    },
}

#[derive(Debug)]
pub struct StateTree {
    nodes: HashMap<NodeId, StateNode>,
    next_id: u32,
    track_changes: bool,
    pending_changes: Vec<NodeChange>,
}

impl Default for StateTree {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTree {
    /// Create a tree holding only the root.
    #[must_use]
    pub fn new() -> Self {
        let mut root = StateNode::new(NodeId::ROOT);
        root.attached = true;
        let mut nodes = HashMap::new();
        nodes.insert(NodeId::ROOT, root);
        Self {
            nodes,
            next_id: NodeId::ROOT.0 + 1,
            track_changes: false,
            pending_changes: Vec::new(),
        }
    }

    /// Create a tree that records every mutation for [`take_changes`](Self::take_changes).
    ///
    /// This is the authoritative (producing) side of the protocol.
    #[must_use]
    pub fn tracking() -> Self {
        Self {
            track_changes: true,
            ..Self::new()
        }
    }

    #[must_use]
    pub fn root(&self) -> &StateNode {
        // The root is inserted at construction and never removed.
        &self.nodes[&NodeId::ROOT]
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&StateNode> {
        self.nodes.get(&id)
    }

    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Number of nodes in the arena, detached ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the arena holds nothing but the root.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    #[must_use]
    pub fn is_attached(&self, id: NodeId) -> bool {
        self.nodes.get(&id).is_some_and(StateNode::is_attached)
    }

    /// Create a node with the next unused id as the last child of `parent`.
    pub fn allocate_node(&mut self, parent: NodeId) -> Result<NodeId, TreeError> {
        if !self.is_attached(parent) {
            return Err(TreeError::InvalidParent(parent));
        }
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(id, StateNode::new(id));
        self.attach_detached(id, parent, None)?;
        self.record(NodeChange::attach(id, parent));
        Ok(id)
    }

    /// Apply one change record.
    ///
    /// Unknown ids are always a protocol or ordering bug on the sending side,
    /// except for `attach`, which introduces them.
    pub fn apply_change(&mut self, change: &NodeChange) -> Result<(), TreeError> {
        match change {
            NodeChange::Attach {
                node_id,
                parent,
                index,
            } => {
                if !self.nodes.contains_key(node_id) {
                    self.nodes.insert(*node_id, StateNode::new(*node_id));
                    self.next_id = self.next_id.max(node_id.0 + 1);
                }
                self.attach_detached(*node_id, *parent, *index)?;
            }
            NodeChange::Detach { node_id } => self.detach_inner(*node_id)?,
            NodeChange::Put {
                node_id,
                feature,
                key,
                value,
            } => {
                let node = self.node_mut(*node_id)?;
                match key {
                    None => {
                        if let Some(existing) = node.features.get(feature) {
                            expect_kind(*node_id, feature, existing, FeatureKind::Scalar)?;
                        }
                        node.features
                            .insert(feature.clone(), FeatureValue::Scalar(value.clone()));
                    }
                    Some(key) => {
                        let entry = node
                            .features
                            .entry(feature.clone())
                            .or_insert_with(|| FeatureValue::Map(BTreeMap::new()));
                        match entry {
                            FeatureValue::Map(map) => {
                                map.insert(key.clone(), value.clone());
                            }
                            other => {
                                expect_kind(*node_id, feature, other, FeatureKind::Map)?;
                            }
                        }
                    }
                }
            }
            NodeChange::Remove {
                node_id,
                feature,
                key,
            } => {
                let node = self.node_mut(*node_id)?;
                match key {
                    None => {
                        node.features.remove(feature);
                    }
                    Some(key) => match node.features.get_mut(feature) {
                        Some(FeatureValue::Map(map)) => {
                            map.remove(key);
                        }
                        Some(other) => {
                            expect_kind(*node_id, feature, other, FeatureKind::Map)?;
                        }
                        None => {}
                    },
                }
            }
            NodeChange::Splice {
                node_id,
                feature,
                index,
                count,
                add,
            } => {
                let node = self.node_mut(*node_id)?;
                let entry = node
                    .features
                    .entry(feature.clone())
                    .or_insert_with(|| FeatureValue::List(Vec::new()));
                match entry {
                    FeatureValue::List(list) => {
                        let start = (*index).min(list.len());
                        let end = start.saturating_add(*count).min(list.len());
                        list.splice(start..end, add.iter().cloned());
                    }
                    other => {
                        expect_kind(*node_id, feature, other, FeatureKind::List)?;
                    }
                }
            }
        }
        self.record(change.clone());
        Ok(())
    }

    /// Apply a batch in order, stopping at the first failure.
    pub fn apply_changes<'a>(
        &mut self,
        changes: impl IntoIterator<Item = &'a NodeChange>,
    ) -> Result<usize, TreeError> {
        let mut applied = 0;
        for change in changes {
            self.apply_change(change)?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Detach `id` (and its subtree) from its parent.
    pub fn detach(&mut self, id: NodeId) -> Result<(), TreeError> {
        self.detach_inner(id)?;
        self.record(NodeChange::Detach { node_id: id });
        Ok(())
    }

    /// Drop every detached node from the arena. Returns the number removed.
    pub fn purge_detached(&mut self) -> usize {
        let before = self.nodes.len();
        self.nodes.retain(|_, node| node.attached);
        let purged = before - self.nodes.len();
        if purged > 0 {
            debug!(purged, "Purged detached nodes");
        }
        purged
    }

    /// Attached node ids in depth-first pre-order, starting at the root.
    #[must_use]
    pub fn walk_pre_order(&self) -> Vec<NodeId> {
        self.subtree_pre_order(NodeId::ROOT)
    }

    /// `id` and its descendants in depth-first pre-order.
    #[must_use]
    pub fn subtree_pre_order(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get(&current) else {
                continue;
            };
            out.push(current);
            stack.extend(node.children.iter().rev().copied());
        }
        out
    }

    /// Drain the recorded changes (empty unless the tree is tracking).
    pub fn take_changes(&mut self) -> Vec<NodeChange> {
        std::mem::take(&mut self.pending_changes)
    }

    #[must_use]
    pub fn has_pending_changes(&self) -> bool {
        !self.pending_changes.is_empty()
    }

    /// The full attached state as a change list that rebuilds this tree when
    /// replayed onto a fresh one.
    #[must_use]
    pub fn snapshot_changes(&self) -> Vec<NodeChange> {
        let mut out = Vec::new();
        for id in self.walk_pre_order() {
            let node = &self.nodes[&id];
            if let Some(parent) = node.parent {
                out.push(NodeChange::attach(id, parent));
            }
            for (name, value) in &node.features {
                match value {
                    FeatureValue::Scalar(v) => out.push(NodeChange::put(id, name.clone(), v.clone())),
                    FeatureValue::Map(map) => {
                        for (key, v) in map {
                            out.push(NodeChange::put_entry(id, name.clone(), key.clone(), v.clone()));
                        }
                    }
                    FeatureValue::List(list) => out.push(NodeChange::Splice {
                        node_id: id,
                        feature: name.clone(),
                        index: 0,
                        count: 0,
                        add: list.clone(),
                    }),
                }
            }
        }
        out
    }

    /// Replace the whole tree with the state described by `snapshot`.
    ///
    /// Nothing of the previous state survives except the id counter, which
    /// only ever grows.
    ///
    /// On error the tree holds whatever part of the snapshot applied, and
    /// keeps its tracking mode.
    pub fn replace_with_snapshot(&mut self, snapshot: &[NodeChange]) -> Result<(), TreeError> {
        let next_id = self.next_id;
        let track_changes = self.track_changes;
        *self = Self::new();
        self.next_id = next_id;
        let result = self.apply_changes(snapshot);
        self.pending_changes.clear();
        self.track_changes = track_changes;
        result.map(|_| ())
    }

    /// Indented pre-order dump for debugging.
    #[must_use]
    pub fn debug_dump(&self) -> String {
        let mut out = String::new();
        self.dump_node(NodeId::ROOT, 0, &mut out);
        out
    }

    fn dump_node(&self, id: NodeId, depth: usize, out: &mut String) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        let _ = write!(out, "{:indent$}{}", "", id, indent = depth * 2);
        for (name, value) in &node.features {
            match value {
                FeatureValue::Scalar(v) => {
                    let _ = write!(out, " {}={}", name, v);
                }
                FeatureValue::Map(m) => {
                    let _ = write!(out, " {}={}", name, Value::Object(m.clone().into_iter().collect()));
                }
                FeatureValue::List(l) => {
                    let _ = write!(out, " {}={}", name, Value::Array(l.clone()));
                }
            }
        }
        out.push('\n');
        for child in &node.children {
            self.dump_node(*child, depth + 1, out);
        }
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut StateNode, TreeError> {
        self.nodes.get_mut(&id).ok_or(TreeError::UnknownNode(id))
    }

    fn record(&mut self, change: NodeChange) {
        if self.track_changes {
            self.pending_changes.push(change);
        }
    }

    /// Link a detached node under an attached parent and mark its subtree attached.
    fn attach_detached(
        &mut self,
        id: NodeId,
        parent: NodeId,
        index: Option<usize>,
    ) -> Result<(), TreeError> {
        if id == NodeId::ROOT {
            return Err(TreeError::RootNode);
        }
        if !self.is_attached(parent) {
            return Err(TreeError::InvalidParent(parent));
        }
        let node = self.node_mut(id)?;
        if node.attached {
            return Err(TreeError::AlreadyAttached(id));
        }
        // A node detached along with its ancestor is still listed by its old
        // parent; moving it out of that subtree must unlink it there.
        let previous = node.parent.replace(parent);
        if let Some(old) = previous {
            if let Some(old) = self.nodes.get_mut(&old) {
                old.children.retain(|c| *c != id);
            }
        }

        let siblings = &mut self.node_mut(parent)?.children;
        let at = index.unwrap_or(siblings.len()).min(siblings.len());
        siblings.insert(at, id);

        // Every node listed as a child names that parent, and attached nodes
        // only list attached children, so the detached node cannot be an
        // ancestor of the attached parent: no cycle is possible.
        for descendant in self.subtree_pre_order(id) {
            if let Some(n) = self.nodes.get_mut(&descendant) {
                n.attached = true;
            }
        }
        Ok(())
    }

    fn detach_inner(&mut self, id: NodeId) -> Result<(), TreeError> {
        if id == NodeId::ROOT {
            return Err(TreeError::RootNode);
        }
        let parent = self.node_mut(id)?.parent.take();
        if let Some(parent) = parent {
            if let Some(p) = self.nodes.get_mut(&parent) {
                p.children.retain(|c| *c != id);
            }
        }
        for descendant in self.subtree_pre_order(id) {
            if let Some(n) = self.nodes.get_mut(&descendant) {
                n.attached = false;
            }
        }
        Ok(())
    }
}

fn expect_kind(
    node: NodeId,
    feature: &str,
    actual: &FeatureValue,
    expected: FeatureKind,
) -> Result<(), TreeError> {
    if actual.kind() == expected {
        Ok(())
    } else {
        Err(TreeError::FeatureTypeMismatch {
            node,
            feature: feature.to_string(),
            expected,
            actual: actual.kind(),
        })
    }
}
