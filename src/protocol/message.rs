// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire messages exchanged between the client core and the session.
//!
//! A [`ChangeMessage`] is an ordered batch of [`NodeChange`]s tagged with a
//! sequence id. The session numbers its messages contiguously; the receiver
//! applies them strictly in that order.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tree::{NodeChange, NodeId};

/// Sequence-numbered batch of tree changes.
///
/// # Example
///
/// ```
/// use tree_sync::{ChangeMessage, NodeChange, NodeId};
/// use serde_json::json;
///
/// let msg = ChangeMessage::new(1, vec![
///     NodeChange::attach(NodeId(2), NodeId::ROOT),
///     NodeChange::put(NodeId(2), "text", json!("hi")),
/// ]);
/// assert!(!msg.resync);
/// assert_eq!(msg.changes.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeMessage {
    pub sequence_id: u64,
    /// When true the changes describe the entire tree and replace local
    /// state instead of patching it.
    #[serde(default)]
    pub resync: bool,
    #[serde(default)]
    pub changes: Vec<NodeChange>,
}

impl ChangeMessage {
    #[must_use]
    pub fn new(sequence_id: u64, changes: Vec<NodeChange>) -> Self {
        Self {
            sequence_id,
            resync: false,
            changes,
        }
    }

    #[must_use]
    pub fn snapshot(sequence_id: u64, changes: Vec<NodeChange>) -> Self {
        Self {
            sequence_id,
            resync: true,
            changes,
        }
    }
}

/// A UI event captured on the rendering surface, bound for the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    pub node_id: NodeId,
    pub event_type: String,
    #[serde(default)]
    pub event_data: Value,
}

impl EventMessage {
    pub fn new(node_id: NodeId, event_type: impl Into<String>, event_data: Value) -> Self {
        Self {
            node_id,
            event_type: event_type.into(),
            event_data,
        }
    }
}

/// What the client expects back from a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RequestKind {
    /// Regular request (events and/or poll): answered with the next diff.
    Normal,
    /// Gap fill: re-send messages `from..=to`.
    Resend { from: u64, to: u64 },
    /// No prior sequence assumption: answered with a full snapshot.
    Resynchronize,
}

/// Client → session request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    /// Client message id; a re-sent request keeps its id so the session can
    /// skip events it already dispatched.
    pub client_id: u64,
    pub kind: RequestKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sequence_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<EventMessage>,
}

impl SyncRequest {
    /// A zero-payload poll.
    #[must_use]
    pub fn is_poll(&self) -> bool {
        self.kind == RequestKind::Normal && self.events.is_empty()
    }
}

/// Session → client response envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    #[serde(default)]
    pub messages: Vec<ChangeMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let request = SyncRequest {
            client_id: 4,
            kind: RequestKind::Resend { from: 3, to: 5 },
            last_sequence_id: Some(2),
            events: vec![],
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "clientId": 4,
                "kind": {"type": "resend", "from": 3, "to": 5},
                "lastSequenceId": 2
            })
        );
    }

    #[test]
    fn test_event_message_wire_shape() {
        let event = EventMessage::new(NodeId(3), "click", json!({"button": 0}));
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"nodeId": 3, "eventType": "click", "eventData": {"button": 0}})
        );
    }

    #[test]
    fn test_is_poll() {
        let mut request = SyncRequest {
            client_id: 1,
            kind: RequestKind::Normal,
            last_sequence_id: None,
            events: vec![],
        };
        assert!(request.is_poll());

        request.events.push(EventMessage::new(NodeId(2), "click", Value::Null));
        assert!(!request.is_poll());

        request.events.clear();
        request.kind = RequestKind::Resynchronize;
        assert!(!request.is_poll());
    }

    #[test]
    fn test_change_message_defaults() {
        let msg: ChangeMessage = serde_json::from_value(json!({"sequenceId": 9})).unwrap();
        assert_eq!(msg, ChangeMessage::new(9, vec![]));
    }
}
