// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Node change records: the unit of every diff.
//!
//! # Wire Format
//!
//! ```text
//! {"op":"attach","nodeId":2,"parent":1}
//! {"op":"put","nodeId":2,"feature":"text","value":"hi"}
//! {"op":"put","nodeId":2,"feature":"attributes","key":"id","value":"main"}
//! {"op":"remove","nodeId":2,"feature":"attributes","key":"id"}
//! {"op":"splice","nodeId":2,"feature":"classes","index":0,"count":1,"add":["a"]}
//! {"op":"detach","nodeId":2}
//! ```
//!
//! `put`/`remove` without a `key` address a scalar feature (or the whole feature
//! for `remove`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::node::NodeId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum NodeChange {
    /// Attach `node_id` under `parent` (creating it if unknown).
    Attach {
        node_id: NodeId,
        parent: NodeId,
        /// Insert position among the parent's children; appended when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
    },
    /// Detach `node_id` and its subtree from the parent.
    Detach { node_id: NodeId },
    Put {
        node_id: NodeId,
        feature: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
        value: Value,
    },
    Remove {
        node_id: NodeId,
        feature: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
    },
    /// Remove `count` values at `index`, then insert `add` there.
    Splice {
        node_id: NodeId,
        feature: String,
        index: usize,
        #[serde(default)]
        count: usize,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        add: Vec<Value>,
    },
}

impl NodeChange {
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        match self {
            Self::Attach { node_id, .. }
            | Self::Detach { node_id }
            | Self::Put { node_id, .. }
            | Self::Remove { node_id, .. }
            | Self::Splice { node_id, .. } => *node_id,
        }
    }

    /// Feature name touched by the change (structural changes have none).
    #[must_use]
    pub fn feature(&self) -> Option<&str> {
        match self {
            Self::Put { feature, .. } | Self::Remove { feature, .. } | Self::Splice { feature, .. } => {
                Some(feature)
            }
            Self::Attach { .. } | Self::Detach { .. } => None,
        }
    }

    #[must_use]
    pub fn op_name(&self) -> &'static str {
        match self {
            Self::Attach { .. } => "attach",
            Self::Detach { .. } => "detach",
            Self::Put { .. } => "put",
            Self::Remove { .. } => "remove",
            Self::Splice { .. } => "splice",
        }
    }

    /// Scalar put: `feature = value`.
    pub fn put(node_id: NodeId, feature: impl Into<String>, value: Value) -> Self {
        Self::Put {
            node_id,
            feature: feature.into(),
            key: None,
            value,
        }
    }

    /// Map put: `feature[key] = value`.
    pub fn put_entry(
        node_id: NodeId,
        feature: impl Into<String>,
        key: impl Into<String>,
        value: Value,
    ) -> Self {
        Self::Put {
            node_id,
            feature: feature.into(),
            key: Some(key.into()),
            value,
        }
    }

    pub fn attach(node_id: NodeId, parent: NodeId) -> Self {
        Self::Attach {
            node_id,
            parent,
            index: None,
        }
    }
}
