// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Outbound request assembly.
//!
//! The [`MessageSender`] collects what the next request has to carry (queued
//! events, a gap-fill range, a resync or poll demand) and turns it into one
//! [`SyncRequest`] when the tracker allows a send. Priority order:
//! resynchronize, then resend, then a normal request with events (or a poll).

use tracing::debug;

use crate::protocol::{EventMessage, RequestKind, SyncRequest};

#[derive(Debug, Default)]
pub struct MessageSender {
    pending_events: Vec<EventMessage>,
    resync_requested: bool,
    resend_range: Option<(u64, u64)>,
    poll_requested: bool,
    next_client_id: u64,
    /// Last request sent and not yet answered.
    unacknowledged: Option<SyncRequest>,
    /// Request to re-send verbatim on the next send.
    retry: Option<SyncRequest>,
}

impl MessageSender {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an event to the next outgoing request.
    pub fn queue_event(&mut self, event: EventMessage) {
        self.pending_events.push(event);
    }

    pub fn request_resync(&mut self) {
        self.resync_requested = true;
        self.resend_range = None;
    }

    /// Ask for messages `from..=to`; merges with a range already asked for.
    pub fn request_resend(&mut self, from: u64, to: u64) {
        if self.resync_requested {
            return;
        }
        self.resend_range = Some(match self.resend_range {
            Some((a, b)) => (a.min(from), b.max(to)),
            None => (from, to),
        });
    }

    pub fn request_poll(&mut self) {
        self.poll_requested = true;
    }

    #[must_use]
    pub fn pending_event_count(&self) -> usize {
        self.pending_events.len()
    }

    #[must_use]
    pub fn resync_requested(&self) -> bool {
        self.resync_requested
    }

    /// Whether anything is waiting to be sent.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.resync_requested
            || self.retry.is_some()
            || self.resend_range.is_some()
            || self.poll_requested
            || !self.pending_events.is_empty()
    }

    /// Build the next request, or `None` when there is nothing to send.
    ///
    /// A resynchronize request reuses the client id and events of an
    /// unacknowledged request so the session can tell whether it already
    /// dispatched them.
    pub fn next_request(&mut self, last_sequence_id: Option<u64>) -> Option<SyncRequest> {
        let request = if self.resync_requested {
            self.resync_requested = false;
            self.resend_range = None;
            let (client_id, events) = match self.unacknowledged.take().or_else(|| self.retry.take()) {
                Some(prev) => (prev.client_id, prev.events),
                None => (self.allocate_client_id(), Vec::new()),
            };
            SyncRequest {
                client_id,
                kind: RequestKind::Resynchronize,
                last_sequence_id: None,
                events,
            }
        } else if let Some(retry) = self.retry.take() {
            retry
        } else if let Some((from, to)) = self.resend_range.take() {
            SyncRequest {
                client_id: self.allocate_client_id(),
                kind: RequestKind::Resend { from, to },
                last_sequence_id,
                events: Vec::new(),
            }
        } else if self.poll_requested || !self.pending_events.is_empty() {
            self.poll_requested = false;
            SyncRequest {
                client_id: self.allocate_client_id(),
                kind: RequestKind::Normal,
                last_sequence_id,
                events: std::mem::take(&mut self.pending_events),
            }
        } else {
            return None;
        };
        debug!(client_id = request.client_id, kind = ?request.kind, events = request.events.len(), "Built request");
        self.unacknowledged = Some(request.clone());
        Some(request)
    }

    /// Whether a sent request is still waiting for its response.
    #[must_use]
    pub fn has_unacknowledged(&self) -> bool {
        self.unacknowledged.is_some()
    }

    /// The response to `client_id` arrived. Returns the request it answers.
    pub fn acknowledge(&mut self, client_id: u64) -> Option<SyncRequest> {
        if self
            .unacknowledged
            .as_ref()
            .is_some_and(|r| r.client_id == client_id)
        {
            self.unacknowledged.take()
        } else {
            None
        }
    }

    /// The request that is still waiting for its response, if any.
    pub fn take_unacknowledged(&mut self) -> Option<SyncRequest> {
        self.unacknowledged.take()
    }

    /// Re-send the unacknowledged request verbatim (same client id) on the
    /// next send. Returns false when there is nothing to re-send.
    pub fn requeue_unacknowledged(&mut self) -> bool {
        match self.unacknowledged.take() {
            Some(request) => {
                self.retry = Some(request);
                true
            }
            None => false,
        }
    }

    /// Forget everything queued (shutdown).
    pub fn clear(&mut self) {
        self.pending_events.clear();
        self.resync_requested = false;
        self.resend_range = None;
        self.poll_requested = false;
        self.unacknowledged = None;
        self.retry = None;
    }

    fn allocate_client_id(&mut self) -> u64 {
        let id = self.next_client_id;
        self.next_client_id += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::NodeId;
    use serde_json::Value;

    fn click() -> EventMessage {
        EventMessage::new(NodeId(2), "click", Value::Null)
    }

    #[test]
    fn test_nothing_to_send() {
        let mut sender = MessageSender::new();
        assert!(!sender.has_pending());
        assert!(sender.next_request(Some(1)).is_none());
    }

    #[test]
    fn test_events_ride_on_normal_request() {
        let mut sender = MessageSender::new();
        sender.queue_event(click());
        sender.queue_event(click());

        let request = sender.next_request(Some(4)).unwrap();
        assert_eq!(request.kind, RequestKind::Normal);
        assert_eq!(request.events.len(), 2);
        assert_eq!(request.last_sequence_id, Some(4));
        assert_eq!(sender.pending_event_count(), 0);
    }

    #[test]
    fn test_poll_is_empty_normal_request() {
        let mut sender = MessageSender::new();
        sender.request_poll();
        let request = sender.next_request(None).unwrap();
        assert!(request.is_poll());
        assert!(!sender.has_pending());
        assert!(sender.has_unacknowledged());
        sender.acknowledge(request.client_id);
        assert!(!sender.has_unacknowledged());
    }

    #[test]
    fn test_priority_and_range_merge() {
        let mut sender = MessageSender::new();
        sender.queue_event(click());
        sender.request_resend(3, 3);
        sender.request_resend(2, 4);

        let first = sender.next_request(Some(1)).unwrap();
        assert_eq!(first.kind, RequestKind::Resend { from: 2, to: 4 });
        assert!(first.events.is_empty());

        let second = sender.next_request(Some(4)).unwrap();
        assert_eq!(second.kind, RequestKind::Normal);
        assert_eq!(second.events.len(), 1);
        assert!(second.client_id > first.client_id);
    }

    #[test]
    fn test_resync_reuses_unacknowledged_request() {
        let mut sender = MessageSender::new();
        sender.queue_event(click());
        let lost = sender.next_request(Some(1)).unwrap();

        sender.request_resync();
        let resync = sender.next_request(Some(1)).unwrap();
        assert_eq!(resync.kind, RequestKind::Resynchronize);
        assert_eq!(resync.client_id, lost.client_id);
        assert_eq!(resync.events, lost.events);
        assert_eq!(resync.last_sequence_id, None);
    }

    #[test]
    fn test_requeued_request_keeps_its_client_id() {
        let mut sender = MessageSender::new();
        sender.queue_event(click());
        let lost = sender.next_request(Some(3)).unwrap();

        assert!(sender.requeue_unacknowledged());
        sender.queue_event(click());
        let again = sender.next_request(Some(3)).unwrap();
        assert_eq!(again, lost);

        // Events queued meanwhile go out with the following request.
        let next = sender.next_request(Some(4)).unwrap();
        assert_eq!(next.events.len(), 1);
        assert_ne!(next.client_id, lost.client_id);
    }

    #[test]
    fn test_acknowledge_clears_unacknowledged() {
        let mut sender = MessageSender::new();
        sender.request_poll();
        let request = sender.next_request(None).unwrap();

        assert!(sender.acknowledge(request.client_id + 1).is_none());
        assert!(sender.take_unacknowledged().is_some());

        sender.request_resend(2, 3);
        let request = sender.next_request(Some(1)).unwrap();
        let answered = sender.acknowledge(request.client_id).unwrap();
        assert_eq!(answered.kind, RequestKind::Resend { from: 2, to: 3 });
        assert!(sender.take_unacknowledged().is_none());
    }
}
