// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The authoritative side of the protocol.
//!
//! A [`UiSession`] owns a change-tracking [`StateTree`]. Application code
//! mutates the tree (directly or from event handlers); every request or
//! [`push`](UiSession::push) turns the recorded mutations into the next
//! sequence-numbered [`ChangeMessage`].
//!
//! ```text
//! SyncRequest ──▶ dedup by client id ──▶ EventRouter ──▶ StateTree (tracking)
//!                                                             │ take_changes
//!                                                             ▼
//! SyncResponse ◀── history (bounded) ◀──────────── ChangeMessage(seq N)
//! ```

pub mod router;

use std::collections::VecDeque;

use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::error::ErrorSink;
use crate::protocol::{ChangeMessage, RequestKind, SyncRequest, SyncResponse};
use crate::tree::StateTree;

pub use router::{EventHandler, EventRouter, EventRouterBuilder, PROPERTY_SYNC_EVENT};

pub struct UiSession {
    tree: StateTree,
    router: EventRouter,
    sink: ErrorSink,
    next_sequence_id: u64,
    history: VecDeque<ChangeMessage>,
    history_limit: usize,
    last_client_id: Option<u64>,
    last_response: Option<SyncResponse>,
}

impl std::fmt::Debug for UiSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UiSession")
            .field("nodes", &self.tree.len())
            .field("next_sequence_id", &self.next_sequence_id)
            .field("history", &self.history.len())
            .field("router", &self.router)
            .finish()
    }
}

impl UiSession {
    #[must_use]
    pub fn new(config: &SyncConfig, router: EventRouter) -> Self {
        Self {
            tree: StateTree::tracking(),
            router,
            sink: ErrorSink::default(),
            next_sequence_id: config.initial_sequence_id,
            history: VecDeque::new(),
            history_limit: config.session_history.max(1),
            last_client_id: None,
            last_response: None,
        }
    }

    #[must_use]
    pub fn with_error_sink(mut self, sink: ErrorSink) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn tree(&self) -> &StateTree {
        &self.tree
    }

    /// Mutable access for application code; mutations are sent with the
    /// next response or push.
    pub fn tree_mut(&mut self) -> &mut StateTree {
        &mut self.tree
    }

    /// Run `f` against the tree and return the message carrying its changes.
    pub fn update<T>(&mut self, f: impl FnOnce(&mut StateTree) -> T) -> (T, Option<ChangeMessage>) {
        let out = f(&mut self.tree);
        (out, self.push())
    }

    /// Sequence id of the most recent message produced.
    #[must_use]
    pub fn last_sequence_id(&self) -> u64 {
        self.next_sequence_id.saturating_sub(1)
    }

    /// Package pending changes into a message, if there are any.
    pub fn push(&mut self) -> Option<ChangeMessage> {
        if !self.tree.has_pending_changes() {
            return None;
        }
        Some(self.next_message())
    }

    /// A snapshot of the whole tree under a fresh sequence id. Pending
    /// changes are folded into it.
    pub fn snapshot(&mut self) -> ChangeMessage {
        self.tree.take_changes();
        let message = ChangeMessage::snapshot(self.allocate_sequence_id(), self.tree.snapshot_changes());
        self.remember(message.clone());
        message
    }

    /// Answer one client request.
    ///
    /// A request re-sent under the same client id does not dispatch its
    /// events again; a re-sent `Normal` request gets the cached response.
    pub fn handle_request(&mut self, request: SyncRequest) -> SyncResponse {
        let duplicate = self.last_client_id == Some(request.client_id);
        if duplicate {
            debug!(client_id = request.client_id, "Duplicate request; skipping events");
            if request.kind == RequestKind::Normal {
                if let Some(cached) = &self.last_response {
                    return cached.clone();
                }
            }
        } else {
            for event in &request.events {
                self.router.dispatch(&mut self.tree, event, &self.sink);
            }
        }

        let response = match request.kind {
            RequestKind::Normal => SyncResponse {
                messages: vec![self.next_message()],
            },
            RequestKind::Resend { from, to } => SyncResponse {
                messages: self.resend(from, to),
            },
            RequestKind::Resynchronize => {
                info!(client_id = request.client_id, "Client requested resynchronization");
                SyncResponse {
                    messages: vec![self.snapshot()],
                }
            }
        };

        self.last_client_id = Some(request.client_id);
        self.last_response = Some(response.clone());
        response
    }

    /// Messages `from..=to` from history, or a snapshot when part of the
    /// range has already been evicted. Changes made since the last message
    /// are appended so nothing is held back.
    fn resend(&mut self, from: u64, to: u64) -> Vec<ChangeMessage> {
        let to = to.min(self.last_sequence_id());
        let oldest = self.history.front().map(|m| m.sequence_id);
        let covered = from <= to && oldest.is_some_and(|oldest| oldest <= from);
        if !covered {
            info!(from, to, ?oldest, "Resend range no longer in history; sending snapshot");
            return vec![self.snapshot()];
        }
        let mut messages: Vec<ChangeMessage> = self
            .history
            .iter()
            .filter(|m| (from..=to).contains(&m.sequence_id))
            .cloned()
            .collect();
        if let Some(fresh) = self.push() {
            messages.push(fresh);
        }
        messages
    }

    fn next_message(&mut self) -> ChangeMessage {
        let changes = self.tree.take_changes();
        let message = ChangeMessage::new(self.allocate_sequence_id(), changes);
        self.tree.purge_detached();
        self.remember(message.clone());
        message
    }

    fn allocate_sequence_id(&mut self) -> u64 {
        let id = self.next_sequence_id;
        self.next_sequence_id += 1;
        id
    }

    fn remember(&mut self, message: ChangeMessage) {
        self.history.push_back(message);
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EventMessage;
    use crate::tree::{NodeChange, NodeId};
    use serde_json::{json, Value};

    fn session() -> UiSession {
        let router = EventRouter::builder()
            .on("click", |tree: &mut StateTree, event: &EventMessage| {
                tree.apply_change(&NodeChange::put(event.node_id, "text", json!("clicked")))?;
                Ok(())
            })
            .build();
        UiSession::new(&SyncConfig::default(), router)
    }

    fn normal(client_id: u64, events: Vec<EventMessage>) -> SyncRequest {
        SyncRequest {
            client_id,
            kind: RequestKind::Normal,
            last_sequence_id: None,
            events,
        }
    }

    #[test]
    fn test_push_numbers_messages_contiguously() {
        let mut session = session();
        assert!(session.push().is_none());

        let (id, first) = session.update(|tree| tree.allocate_node(NodeId::ROOT).unwrap());
        let first = first.unwrap();
        assert_eq!(first.sequence_id, 1);
        assert_eq!(first.changes, vec![NodeChange::attach(id, NodeId::ROOT)]);

        let (_, second) = session.update(|tree| {
            tree.apply_change(&NodeChange::put(id, "text", json!("hi"))).unwrap()
        });
        assert_eq!(second.unwrap().sequence_id, 2);
        assert_eq!(session.last_sequence_id(), 2);
    }

    #[test]
    fn test_request_dispatches_events_and_returns_diff() {
        let mut session = session();
        let (id, _) = session.update(|tree| tree.allocate_node(NodeId::ROOT).unwrap());

        let response = session.handle_request(normal(0, vec![EventMessage::new(id, "click", Value::Null)]));
        assert_eq!(response.messages.len(), 1);
        assert_eq!(response.messages[0].sequence_id, 2);
        assert_eq!(
            response.messages[0].changes,
            vec![NodeChange::put(id, "text", json!("clicked"))]
        );
    }

    #[test]
    fn test_duplicate_request_returns_cached_response() {
        let mut session = session();
        let (id, _) = session.update(|tree| tree.allocate_node(NodeId::ROOT).unwrap());
        let request = normal(7, vec![EventMessage::new(id, "click", Value::Null)]);

        let first = session.handle_request(request.clone());
        let again = session.handle_request(request);
        assert_eq!(first, again);
        assert_eq!(session.last_sequence_id(), 2);
    }

    #[test]
    fn test_resend_from_history() {
        let mut session = session();
        let (id, _) = session.update(|tree| tree.allocate_node(NodeId::ROOT).unwrap());
        session.update(|tree| tree.apply_change(&NodeChange::put(id, "text", json!("a"))).unwrap());
        session.update(|tree| tree.apply_change(&NodeChange::put(id, "text", json!("b"))).unwrap());

        let response = session.handle_request(SyncRequest {
            client_id: 0,
            kind: RequestKind::Resend { from: 2, to: 3 },
            last_sequence_id: Some(1),
            events: vec![],
        });
        let ids: Vec<u64> = response.messages.iter().map(|m| m.sequence_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_resend_outside_history_sends_snapshot() {
        let config = SyncConfig {
            session_history: 2,
            ..Default::default()
        };
        let mut session = UiSession::new(&config, EventRouter::default());
        let (id, _) = session.update(|tree| tree.allocate_node(NodeId::ROOT).unwrap());
        for text in ["a", "b", "c"] {
            session.update(|tree| tree.apply_change(&NodeChange::put(id, "text", json!(text))).unwrap());
        }

        let response = session.handle_request(SyncRequest {
            client_id: 0,
            kind: RequestKind::Resend { from: 1, to: 4 },
            last_sequence_id: None,
            events: vec![],
        });
        assert_eq!(response.messages.len(), 1);
        let snapshot = &response.messages[0];
        assert!(snapshot.resync);
        assert_eq!(snapshot.sequence_id, 5);

        let mut replica = StateTree::new();
        replica.replace_with_snapshot(&snapshot.changes).unwrap();
        assert_eq!(replica.debug_dump(), session.tree().debug_dump());
    }

    #[test]
    fn test_resynchronize_answers_with_snapshot() {
        let mut session = session();
        session.update(|tree| tree.allocate_node(NodeId::ROOT).unwrap());

        let response = session.handle_request(SyncRequest {
            client_id: 0,
            kind: RequestKind::Resynchronize,
            last_sequence_id: None,
            events: vec![],
        });
        assert!(response.messages[0].resync);
        assert_eq!(response.messages[0].sequence_id, 2);
    }

    #[test]
    fn test_detached_nodes_purged_after_message() {
        let mut session = session();
        let (id, _) = session.update(|tree| tree.allocate_node(NodeId::ROOT).unwrap());
        let (_, msg) = session.update(|tree| tree.detach(id).unwrap());

        assert_eq!(msg.unwrap().changes, vec![NodeChange::Detach { node_id: id }]);
        assert!(!session.tree().contains(id));
    }
}
