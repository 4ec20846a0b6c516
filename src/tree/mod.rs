// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! State tree: nodes, features and the change records that mutate them.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                          Tree Module                           │
//! ├────────────────────────────────────────────────────────────────┤
//! │  node.rs        - NodeId, StateNode, FeatureValue              │
//! │  change.rs      - NodeChange (attach/detach/put/remove/splice) │
//! │  state_tree.rs  - StateTree arena, diffs, snapshots            │
//! └────────────────────────────────────────────────────────────────┘
//! ```

pub mod change;
pub mod node;
pub mod state_tree;

pub use change::NodeChange;
pub use node::{FeatureKind, FeatureValue, NodeCapabilities, NodeId, StateNode};
pub use state_tree::{StateTree, TreeError};

/// Well-known feature names understood by the binder and the client.
pub mod features {
    /// Scalar string: element tag name.
    pub const TAG: &str = "tag";
    /// Scalar string: text content.
    pub const TEXT: &str = "text";
    /// Map: attribute name → value (null removes).
    pub const ATTRIBUTES: &str = "attributes";
    /// Map: event type → listener options.
    pub const LISTENERS: &str = "listeners";
    /// Map: property name → value, synchronized back from the surface.
    pub const PROPERTIES: &str = "properties";
    /// Scalar number on the root: poll interval in milliseconds (<= 0 disables).
    pub const POLL_INTERVAL: &str = "pollInterval";
    /// Scalar number on the root: reconnect attempts before giving up
    /// (negative means unlimited).
    pub const RECONNECT_ATTEMPTS: &str = "reconnectAttempts";
    /// Scalar number on the root: fixed delay between reconnect attempts in
    /// milliseconds.
    pub const RECONNECT_INTERVAL: &str = "reconnectInterval";
    /// Scalar numbers on the root: how long a request may be outstanding
    /// before the loading indicator enters each stage, in milliseconds.
    pub const LOADING_FIRST_DELAY: &str = "loadingIndicatorFirstDelay";
    pub const LOADING_SECOND_DELAY: &str = "loadingIndicatorSecondDelay";
    pub const LOADING_THIRD_DELAY: &str = "loadingIndicatorThirdDelay";
}
