// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event routing on the session side.
//!
//! The routing table is assembled once through [`EventRouterBuilder`] and is
//! immutable afterwards. Handlers for one event type run in registration
//! order; a failing or panicking handler is reported to the [`ErrorSink`] and
//! the remaining handlers still run.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ErrorSink, SyncError};
use crate::protocol::EventMessage;
use crate::tree::{features, NodeChange, StateTree};

/// Event type carrying a property value written on the surface.
pub const PROPERTY_SYNC_EVENT: &str = "propertySync";

pub type EventHandler =
    Arc<dyn Fn(&mut StateTree, &EventMessage) -> Result<(), SyncError> + Send + Sync>;

#[derive(Default)]
pub struct EventRouterBuilder {
    handlers: HashMap<String, Vec<EventHandler>>,
}

impl EventRouterBuilder {
    #[must_use]
    pub fn on<F>(mut self, event_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut StateTree, &EventMessage) -> Result<(), SyncError> + Send + Sync + 'static,
    {
        self.handlers
            .entry(event_type.into())
            .or_default()
            .push(Arc::new(handler));
        self
    }

    #[must_use]
    pub fn build(self) -> EventRouter {
        EventRouter {
            handlers: self.handlers,
        }
    }
}

/// Immutable event-type → handlers table.
#[derive(Clone, Default)]
pub struct EventRouter {
    handlers: HashMap<String, Vec<EventHandler>>,
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("EventRouter").field("event_types", &types).finish()
    }
}

impl EventRouter {
    #[must_use]
    pub fn builder() -> EventRouterBuilder {
        EventRouterBuilder::default()
    }

    #[must_use]
    pub fn handles(&self, event_type: &str) -> bool {
        event_type == PROPERTY_SYNC_EVENT || self.handlers.contains_key(event_type)
    }

    /// Deliver one event. Returns the number of handlers that succeeded.
    ///
    /// Events for nodes that are no longer attached are dropped: the client
    /// captured them before it saw the detach.
    pub fn dispatch(&self, tree: &mut StateTree, event: &EventMessage, sink: &ErrorSink) -> usize {
        if !tree.is_attached(event.node_id) {
            debug!(node = %event.node_id, event_type = %event.event_type, "Dropping event for detached node");
            return 0;
        }
        crate::metrics::record_event_dispatched(&event.event_type);

        let mut delivered = 0;
        if event.event_type == PROPERTY_SYNC_EVENT {
            if sink
                .guard(PROPERTY_SYNC_EVENT, || apply_property_sync(tree, event))
                .is_some()
            {
                delivered += 1;
            }
        }

        let Some(handlers) = self.handlers.get(&event.event_type) else {
            if delivered == 0 {
                warn!(event_type = %event.event_type, "No handler registered for event");
            }
            return delivered;
        };
        for handler in handlers {
            if sink
                .guard(&event.event_type, || handler(tree, event))
                .is_some()
            {
                delivered += 1;
            }
        }
        delivered
    }
}

/// `{"name": "...", "value": ...}` → `properties[name] = value`.
fn apply_property_sync(tree: &mut StateTree, event: &EventMessage) -> Result<(), SyncError> {
    let name = event
        .event_data
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::Handler {
            context: PROPERTY_SYNC_EVENT.to_string(),
            message: "missing property name".to_string(),
        })?;
    let value = event.event_data.get("value").cloned().unwrap_or(Value::Null);
    tree.apply_change(&NodeChange::put_entry(
        event.node_id,
        features::PROPERTIES,
        name,
        value,
    ))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::tests::RecordingHandler;
    use crate::tree::NodeId;
    use serde_json::json;

    fn tree_with_node() -> (StateTree, NodeId) {
        let mut tree = StateTree::tracking();
        let id = tree.allocate_node(NodeId::ROOT).unwrap();
        tree.take_changes();
        (tree, id)
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let (mut tree, id) = tree_with_node();
        let router = EventRouter::builder()
            .on("click", |tree: &mut StateTree, event: &EventMessage| {
                tree.apply_change(&NodeChange::put(event.node_id, "text", json!("first")))?;
                Ok(())
            })
            .on("click", |tree: &mut StateTree, event: &EventMessage| {
                tree.apply_change(&NodeChange::put(event.node_id, "text", json!("second")))?;
                Ok(())
            })
            .build();

        let delivered = router.dispatch(
            &mut tree,
            &EventMessage::new(id, "click", Value::Null),
            &ErrorSink::default(),
        );
        assert_eq!(delivered, 2);
        assert_eq!(tree.node(id).unwrap().text(), Some("second"));
        assert_eq!(tree.take_changes().len(), 2);
    }

    #[test]
    fn test_failing_handler_does_not_block_others() {
        let (mut tree, id) = tree_with_node();
        let recorder = Arc::new(RecordingHandler::default());
        let sink = ErrorSink::new(recorder.clone());
        let router = EventRouter::builder()
            .on("click", |_: &mut StateTree, _: &EventMessage| panic!("handler bug"))
            .on("click", |tree: &mut StateTree, event: &EventMessage| {
                tree.apply_change(&NodeChange::put(event.node_id, "text", json!("ok")))?;
                Ok(())
            })
            .build();

        let delivered = router.dispatch(&mut tree, &EventMessage::new(id, "click", Value::Null), &sink);
        assert_eq!(delivered, 1);
        assert_eq!(tree.node(id).unwrap().text(), Some("ok"));
        assert_eq!(recorder.errors.lock().len(), 1);
    }

    #[test]
    fn test_property_sync_writes_properties() {
        let (mut tree, id) = tree_with_node();
        let router = EventRouter::default();
        let event = EventMessage::new(id, PROPERTY_SYNC_EVENT, json!({"name": "value", "value": "typed"}));

        assert_eq!(router.dispatch(&mut tree, &event, &ErrorSink::default()), 1);
        assert_eq!(
            tree.node(id).unwrap().map_entry(features::PROPERTIES, "value"),
            Some(&json!("typed"))
        );
    }

    #[test]
    fn test_events_for_detached_nodes_are_dropped() {
        let (mut tree, id) = tree_with_node();
        tree.detach(id).unwrap();
        let router = EventRouter::builder()
            .on("click", |_: &mut StateTree, _: &EventMessage| panic!("must not run"))
            .build();

        let delivered = router.dispatch(
            &mut tree,
            &EventMessage::new(id, "click", Value::Null),
            &ErrorSink::default(),
        );
        assert_eq!(delivered, 0);
    }

    #[test]
    fn test_handles_reports_registered_types() {
        let router = EventRouter::builder()
            .on("input", |_: &mut StateTree, _: &EventMessage| Ok(()))
            .build();
        assert!(router.handles("input"));
        assert!(router.handles(PROPERTY_SYNC_EVENT));
        assert!(!router.handles("click"));
    }
}
