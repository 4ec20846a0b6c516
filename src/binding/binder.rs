// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Projects the state tree onto a [`RenderSurface`].
//!
//! The binder never mutates the tree. After every applied batch (or
//! snapshot) [`Binder::sync`] diffs the attached tree against what it has
//! bound so far and issues the minimal surface calls:
//!
//! 1. unbind nodes that were detached, changed parent, or changed kind
//! 2. create elements for new nodes, update attributes and text
//! 3. fix up child order per parent (insert when possible, else reorder)
//!
//! The node → element map is shared through a `DashMap` so the embedding API
//! can resolve elements without taking the client lock.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use super::surface::{ElementHandle, RenderSurface};
use crate::protocol::EventMessage;
use crate::tree::{features, NodeId, StateNode, StateTree};

#[derive(Debug, Clone, PartialEq, Eq)]
enum BoundKind {
    Element(String),
    Text,
}

impl BoundKind {
    fn of(node: &StateNode) -> Self {
        match node.tag() {
            Some(tag) => Self::Element(tag.to_string()),
            None if node.text().is_some() => Self::Text,
            None => Self::Element("div".to_string()),
        }
    }
}

#[derive(Debug)]
struct BoundNode {
    element: ElementHandle,
    kind: BoundKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    attributes: BTreeMap<String, String>,
    text: Option<String>,
}

pub struct Binder {
    surface: Box<dyn RenderSurface>,
    bound: HashMap<NodeId, BoundNode>,
    by_element: HashMap<ElementHandle, NodeId>,
    elements: Arc<DashMap<NodeId, ElementHandle>>,
}

impl std::fmt::Debug for Binder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binder")
            .field("bound", &self.bound.len())
            .finish_non_exhaustive()
    }
}

impl Binder {
    pub fn new(surface: Box<dyn RenderSurface>) -> Self {
        let root_element = surface.root();
        let mut binder = Self {
            surface,
            bound: HashMap::new(),
            by_element: HashMap::new(),
            elements: Arc::new(DashMap::new()),
        };
        binder.bind(
            NodeId::ROOT,
            BoundNode {
                element: root_element,
                kind: BoundKind::Element("body".to_string()),
                parent: None,
                children: Vec::new(),
                attributes: BTreeMap::new(),
                text: None,
            },
        );
        binder
    }

    /// Shared node → element lookup.
    #[must_use]
    pub fn element_map(&self) -> Arc<DashMap<NodeId, ElementHandle>> {
        Arc::clone(&self.elements)
    }

    #[must_use]
    pub fn element_for_node(&self, id: NodeId) -> Option<ElementHandle> {
        self.elements.get(&id).map(|e| *e)
    }

    #[must_use]
    pub fn node_for_element(&self, element: ElementHandle) -> Option<NodeId> {
        self.by_element.get(&element).copied()
    }

    #[must_use]
    pub fn bound_count(&self) -> usize {
        self.bound.len()
    }

    /// Bring the surface in line with the attached part of `tree`.
    pub fn sync(&mut self, tree: &StateTree) {
        self.unbind_stale(tree);
        let order = tree.walk_pre_order();
        for id in &order {
            if let Some(node) = tree.node(*id) {
                self.update_node(node);
            }
        }
        for id in &order {
            if let Some(node) = tree.node(*id) {
                self.reconcile_children(node);
            }
        }
    }

    /// Drop every binding and rebuild from scratch.
    pub fn rebuild(&mut self, tree: &StateTree) {
        let top: Vec<NodeId> = self
            .bound
            .get(&NodeId::ROOT)
            .map(|root| root.children.clone())
            .unwrap_or_default();
        for id in top {
            self.unbind_subtree(id);
        }
        self.sync(tree);
    }

    /// Turn a raw surface event into an event message, if the node behind
    /// `element` listens for `event_type`.
    #[must_use]
    pub fn capture_event(
        &self,
        tree: &StateTree,
        element: ElementHandle,
        event_type: &str,
        event_data: Value,
    ) -> Option<EventMessage> {
        let id = self.node_for_element(element)?;
        let node = tree.node(id).filter(|n| n.is_attached())?;
        if !node.listens_to(event_type) {
            debug!(node = %id, event_type, "Ignoring event without listener");
            return None;
        }
        Some(EventMessage::new(id, event_type, event_data))
    }

    /// Tear down: remove every bound element from the surface.
    pub fn shut_down(&mut self) {
        let top: Vec<NodeId> = self
            .bound
            .get(&NodeId::ROOT)
            .map(|root| root.children.clone())
            .unwrap_or_default();
        for id in top {
            self.unbind_subtree(id);
        }
    }

    fn unbind_stale(&mut self, tree: &StateTree) {
        let mut stale = Vec::new();
        let mut moved = Vec::new();
        for (id, bound) in &self.bound {
            if *id == NodeId::ROOT {
                continue;
            }
            match tree.node(*id).filter(|n| n.is_attached()) {
                None => stale.push(*id),
                Some(node) if BoundKind::of(node) != bound.kind => stale.push(*id),
                Some(node) if node.parent() != bound.parent => moved.push(*id),
                Some(_) => {}
            }
        }
        for id in stale {
            // An ancestor may already have taken it down.
            if self.bound.contains_key(&id) {
                self.unbind_subtree(id);
            }
        }
        for id in moved {
            if self.bound.contains_key(&id) {
                self.detach_from_parent(id);
            }
        }
    }

    fn update_node(&mut self, node: &StateNode) {
        let id = node.id();
        if !self.bound.contains_key(&id) {
            let kind = BoundKind::of(node);
            let element = match &kind {
                BoundKind::Element(tag) => self.surface.create_element(tag),
                BoundKind::Text => self.surface.create_text(node.text().unwrap_or_default()),
            };
            self.bind(
                id,
                BoundNode {
                    element,
                    text: match kind {
                        BoundKind::Text => node.text().map(str::to_string),
                        BoundKind::Element(_) => None,
                    },
                    kind,
                    parent: None,
                    children: Vec::new(),
                    attributes: BTreeMap::new(),
                },
            );
        }
        let Some(bound) = self.bound.get_mut(&id) else {
            return;
        };
        let surface = self.surface.as_mut();

        let text = node.text().map(str::to_string);
        if id != NodeId::ROOT && bound.text != text {
            surface.set_text(bound.element, text.as_deref().unwrap_or_default());
            bound.text = text;
        }

        let wanted: BTreeMap<String, String> = node
            .feature(features::ATTRIBUTES)
            .and_then(|f| f.as_map())
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| attribute_value(v).map(|v| (k.clone(), v)))
                    .collect()
            })
            .unwrap_or_default();
        for name in bound.attributes.keys() {
            if !wanted.contains_key(name) {
                surface.set_attribute(bound.element, name, None);
            }
        }
        for (name, value) in &wanted {
            if bound.attributes.get(name) != Some(value) {
                surface.set_attribute(bound.element, name, Some(value));
            }
        }
        bound.attributes = wanted;
    }

    fn reconcile_children(&mut self, node: &StateNode) {
        let id = node.id();
        let wanted: Vec<NodeId> = node
            .children()
            .iter()
            .copied()
            .filter(|c| self.bound.contains_key(c))
            .collect();
        let Some(bound) = self.bound.get(&id) else {
            return;
        };
        if bound.children == wanted {
            return;
        }
        let parent_element = bound.element;
        let old = bound.children.clone();
        let old_set: HashSet<NodeId> = old.iter().copied().collect();
        let wanted_set: HashSet<NodeId> = wanted.iter().copied().collect();

        for gone in old.iter().filter(|c| !wanted_set.contains(c)) {
            if let Some(el) = self.element_for_node(*gone) {
                self.surface.remove_child(parent_element, el);
            }
        }

        let kept_old: Vec<NodeId> = old.iter().copied().filter(|c| wanted_set.contains(c)).collect();
        let kept_new: Vec<NodeId> = wanted.iter().copied().filter(|c| old_set.contains(c)).collect();
        if kept_old == kept_new {
            // Only insertions: place each new child before its next placed sibling.
            let mut next: Option<ElementHandle> = None;
            for child in wanted.iter().rev() {
                let Some(el) = self.element_for_node(*child) else {
                    continue;
                };
                if !old_set.contains(child) {
                    match next {
                        Some(before) => self.surface.insert_before(parent_element, el, before),
                        None => self.surface.append_child(parent_element, el),
                    }
                }
                next = Some(el);
            }
        } else {
            for child in &kept_old {
                if let Some(el) = self.element_for_node(*child) {
                    self.surface.remove_child(parent_element, el);
                }
            }
            for child in &wanted {
                if let Some(el) = self.element_for_node(*child) {
                    self.surface.append_child(parent_element, el);
                }
            }
        }

        for child in &wanted {
            if let Some(b) = self.bound.get_mut(child) {
                b.parent = Some(id);
            }
        }
        if let Some(bound) = self.bound.get_mut(&id) {
            bound.children = wanted;
        }
    }

    fn bind(&mut self, id: NodeId, bound: BoundNode) {
        self.by_element.insert(bound.element, id);
        self.elements.insert(id, bound.element);
        self.bound.insert(id, bound);
    }

    fn detach_from_parent(&mut self, id: NodeId) {
        let Some(parent) = self.bound.get(&id).and_then(|b| b.parent) else {
            return;
        };
        let element = self.bound.get(&id).map(|b| b.element);
        if let Some(parent_bound) = self.bound.get_mut(&parent) {
            parent_bound.children.retain(|c| *c != id);
            if let Some(el) = element {
                self.surface.remove_child(parent_bound.element, el);
            }
        }
        if let Some(b) = self.bound.get_mut(&id) {
            b.parent = None;
        }
    }

    fn unbind_subtree(&mut self, id: NodeId) {
        self.detach_from_parent(id);
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(bound) = self.bound.remove(&current) else {
                continue;
            };
            self.by_element.remove(&bound.element);
            self.elements.remove(&current);
            stack.extend(bound.children);
        }
    }
}

fn attribute_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::surface::MemorySurface;
    use crate::tree::NodeChange;
    use serde_json::json;

    fn setup() -> (Binder, MemorySurface, StateTree) {
        let surface = MemorySurface::new();
        let binder = Binder::new(Box::new(surface.clone()));
        (binder, surface, StateTree::new())
    }

    fn apply(tree: &mut StateTree, changes: &[NodeChange]) {
        tree.apply_changes(changes).unwrap();
        tree.purge_detached();
    }

    #[test]
    fn test_creates_elements_with_attributes_and_text() {
        let (mut binder, surface, mut tree) = setup();
        let a = NodeId(2);
        apply(
            &mut tree,
            &[
                NodeChange::attach(a, NodeId::ROOT),
                NodeChange::put(a, features::TAG, json!("span")),
                NodeChange::put(a, features::TEXT, json!("hi")),
                NodeChange::put_entry(a, features::ATTRIBUTES, "class", json!("x")),
            ],
        );
        binder.sync(&tree);

        assert_eq!(surface.render(), "<span class=\"x\">hi</span>");
        assert!(binder.element_for_node(a).is_some());
        assert!(binder.element_map().contains_key(&a));
    }

    #[test]
    fn test_text_only_node_becomes_text() {
        let (mut binder, surface, mut tree) = setup();
        let t = NodeId(2);
        apply(
            &mut tree,
            &[
                NodeChange::attach(t, NodeId::ROOT),
                NodeChange::put(t, features::TEXT, json!("plain")),
            ],
        );
        binder.sync(&tree);
        assert_eq!(surface.render(), "plain");

        apply(&mut tree, &[NodeChange::put(t, features::TEXT, json!("edited"))]);
        binder.sync(&tree);
        assert_eq!(surface.render(), "edited");
    }

    #[test]
    fn test_attribute_removal() {
        let (mut binder, surface, mut tree) = setup();
        let a = NodeId(2);
        apply(
            &mut tree,
            &[
                NodeChange::attach(a, NodeId::ROOT),
                NodeChange::put(a, features::TAG, json!("p")),
                NodeChange::put_entry(a, features::ATTRIBUTES, "hidden", json!(true)),
            ],
        );
        binder.sync(&tree);
        assert_eq!(surface.render(), "<p hidden=\"true\"></p>");

        apply(
            &mut tree,
            &[NodeChange::put_entry(a, features::ATTRIBUTES, "hidden", Value::Null)],
        );
        binder.sync(&tree);
        assert_eq!(surface.render(), "<p></p>");
    }

    #[test]
    fn test_detach_removes_subtree() {
        let (mut binder, surface, mut tree) = setup();
        let (a, b) = (NodeId(2), NodeId(3));
        apply(
            &mut tree,
            &[
                NodeChange::attach(a, NodeId::ROOT),
                NodeChange::put(a, features::TAG, json!("ul")),
                NodeChange::attach(b, a),
                NodeChange::put(b, features::TAG, json!("li")),
            ],
        );
        binder.sync(&tree);
        assert_eq!(surface.render(), "<ul><li></li></ul>");

        apply(&mut tree, &[NodeChange::Detach { node_id: a }]);
        binder.sync(&tree);
        assert_eq!(surface.render(), "");
        assert_eq!(binder.element_for_node(a), None);
        assert_eq!(binder.element_for_node(b), None);
        assert_eq!(binder.bound_count(), 1);
    }

    #[test]
    fn test_insertion_and_move_keep_order() {
        let (mut binder, surface, mut tree) = setup();
        let (a, b, c) = (NodeId(2), NodeId(3), NodeId(4));
        apply(
            &mut tree,
            &[
                NodeChange::attach(a, NodeId::ROOT),
                NodeChange::put(a, features::TAG, json!("a")),
                NodeChange::attach(c, NodeId::ROOT),
                NodeChange::put(c, features::TAG, json!("c")),
            ],
        );
        binder.sync(&tree);

        apply(
            &mut tree,
            &[
                NodeChange::Attach {
                    node_id: b,
                    parent: NodeId::ROOT,
                    index: Some(1),
                },
                NodeChange::put(b, features::TAG, json!("b")),
            ],
        );
        binder.sync(&tree);
        assert_eq!(surface.render(), "<a></a><b></b><c></c>");

        // Move c under a within one batch.
        apply(
            &mut tree,
            &[NodeChange::Detach { node_id: c }, NodeChange::attach(c, a)],
        );
        binder.sync(&tree);
        assert_eq!(surface.render(), "<a><c></c></a><b></b>");
    }

    #[test]
    fn test_capture_event_requires_listener() {
        let (mut binder, _surface, mut tree) = setup();
        let a = NodeId(2);
        apply(
            &mut tree,
            &[
                NodeChange::attach(a, NodeId::ROOT),
                NodeChange::put(a, features::TAG, json!("button")),
                NodeChange::put_entry(a, features::LISTENERS, "click", json!({})),
            ],
        );
        binder.sync(&tree);
        let el = binder.element_for_node(a).unwrap();

        let event = binder.capture_event(&tree, el, "click", json!({"x": 1})).unwrap();
        assert_eq!(event.node_id, a);
        assert!(binder.capture_event(&tree, el, "keydown", Value::Null).is_none());
    }

    #[test]
    fn test_rebuild_recreates_elements() {
        let (mut binder, surface, mut tree) = setup();
        let a = NodeId(2);
        apply(
            &mut tree,
            &[
                NodeChange::attach(a, NodeId::ROOT),
                NodeChange::put(a, features::TAG, json!("p")),
            ],
        );
        binder.sync(&tree);
        let before = binder.element_for_node(a).unwrap();

        binder.rebuild(&tree);
        assert_ne!(binder.element_for_node(a).unwrap(), before);
        assert_eq!(surface.render(), "<p></p>");
    }
}
