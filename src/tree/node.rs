// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! A single addressable vertex of the state tree.
//!
//! Nodes are flat: there is no widget hierarchy. What a node "is" follows from
//! its features (typed maps, lists and scalars keyed by name) and is summarized
//! by [`NodeCapabilities`].

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::features;

/// Identity of a node within one [`StateTree`](super::StateTree).
///
/// Ids are never reused while the tree exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    /// The root node always has this id.
    pub const ROOT: NodeId = NodeId(1);
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Shape of a feature value, used in type-mismatch errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureKind {
    Scalar,
    Map,
    List,
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar => write!(f, "scalar"),
            Self::Map => write!(f, "map"),
            Self::List => write!(f, "list"),
        }
    }
}

/// The value held by one named feature of a node.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureValue {
    Scalar(Value),
    Map(BTreeMap<String, Value>),
    List(Vec<Value>),
}

impl FeatureValue {
    #[must_use]
    pub fn kind(&self) -> FeatureKind {
        match self {
            Self::Scalar(_) => FeatureKind::Scalar,
            Self::Map(_) => FeatureKind::Map,
            Self::List(_) => FeatureKind::List,
        }
    }

    #[must_use]
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            Self::Scalar(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }
}

/// Flat capability set of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeCapabilities {
    pub has_children: bool,
    pub has_text: bool,
    pub has_listeners: bool,
}

/// A vertex of the state tree.
///
/// Parent and child links are ids into the owning tree's arena, so holding a
/// `NodeId` never keeps a node alive.
#[derive(Debug, Clone)]
pub struct StateNode {
    id: NodeId,
    pub(super) parent: Option<NodeId>,
    pub(super) children: Vec<NodeId>,
    pub(super) features: BTreeMap<String, FeatureValue>,
    pub(super) attached: bool,
}

impl StateNode {
    pub(super) fn new(id: NodeId) -> Self {
        Self {
            id,
            parent: None,
            children: Vec::new(),
            features: BTreeMap::new(),
            attached: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[must_use]
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    #[must_use]
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Whether the node is reachable from the root.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    #[must_use]
    pub fn feature(&self, name: &str) -> Option<&FeatureValue> {
        self.features.get(name)
    }

    pub fn features(&self) -> impl Iterator<Item = (&str, &FeatureValue)> {
        self.features.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Scalar feature value, if the feature exists and is a scalar.
    #[must_use]
    pub fn scalar(&self, feature: &str) -> Option<&Value> {
        self.feature(feature).and_then(FeatureValue::as_scalar)
    }

    /// Scalar number of milliseconds, fractions rounded. `None` when the
    /// feature is unset or not a number, `Some(None)` when it is zero or
    /// negative.
    #[must_use]
    pub fn millis(&self, feature: &str) -> Option<Option<Duration>> {
        let ms = self.scalar(feature)?.as_f64().filter(|ms| ms.is_finite())?;
        if ms <= 0.0 {
            return Some(None);
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let ms = ms.round() as u64;
        Some(Some(Duration::from_millis(ms)))
    }

    /// Entry of a map feature.
    #[must_use]
    pub fn map_entry(&self, feature: &str, key: &str) -> Option<&Value> {
        self.feature(feature)
            .and_then(FeatureValue::as_map)
            .and_then(|m| m.get(key))
    }

    /// Text content, when the node carries a string `text` feature.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.scalar(features::TEXT).and_then(Value::as_str)
    }

    /// Element tag, when the node carries a string `tag` feature.
    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        self.scalar(features::TAG).and_then(Value::as_str)
    }

    /// Whether the node has a listener registered for `event_type`.
    #[must_use]
    pub fn listens_to(&self, event_type: &str) -> bool {
        self.map_entry(features::LISTENERS, event_type).is_some()
    }

    #[must_use]
    pub fn capabilities(&self) -> NodeCapabilities {
        NodeCapabilities {
            has_children: !self.children.is_empty(),
            has_text: self.text().is_some(),
            has_listeners: self
                .feature(features::LISTENERS)
                .and_then(FeatureValue::as_map)
                .is_some_and(|m| !m.is_empty()),
        }
    }
}
