// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ordered application of inbound change messages.
//!
//! # Ordering
//!
//! ```text
//! seq <  expected ──▶ Duplicate (dropped, applying twice is a no-op)
//! seq == expected ──▶ apply, then replay contiguous buffered messages
//! seq >  expected ──▶ buffer, report the missing range unless a gap fill
//!                     is already outstanding
//!                     └─ buffer full ──▶ NeedsFullResync
//! gap fill answered ─▶ gap closed, or retry (one attempt used)
//!                     └─ budget exhausted ──▶ NeedsFullResync
//! resync message  ──▶ replace local state, keep newer buffered messages
//! ```
//!
//! The out-of-order buffer is bounded by `max_buffered_messages`. Answered
//! gap fills that leave the gap open are bounded by `max_gap_retries`. Past
//! either bound the buffer is discarded and a snapshot is requested instead.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::metrics::LatencyTimer;
use crate::protocol::ChangeMessage;
use crate::tree::StateTree;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Idle,
    AwaitingResponse,
    Disconnected,
}

/// Why a full resynchronization is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncReason {
    GapBudgetExceeded,
    BufferOverflow,
    ProtocolError,
    LongDowntime,
    Startup,
}

impl ResyncReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GapBudgetExceeded => "gap_budget",
            Self::BufferOverflow => "buffer_overflow",
            Self::ProtocolError => "protocol_error",
            Self::LongDowntime => "long_downtime",
            Self::Startup => "startup",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Messages up to and including `through` are applied.
    Applied { through: u64, messages: usize },
    /// Held back. `missing` is the range to request, unless a snapshot is
    /// already on its way.
    Buffered { missing: Option<RangeInclusive<u64>> },
    Duplicate,
    /// A snapshot replaced local state.
    Resynchronized { sequence_id: u64, replayed: usize },
    /// The caller must request a full resynchronization.
    NeedsFullResync { reason: ResyncReason },
}

/// What to do after a gap-fill request has been answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GapFillOutcome {
    /// Nothing is missing any more.
    Closed,
    /// Still missing: ask for this range again.
    Retry(RangeInclusive<u64>),
    NeedsFullResync,
}

/// Processing time bookkeeping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessingStats {
    pub last_processing: Duration,
    pub total_processing: Duration,
    pub messages_applied: u64,
    /// Time from handler creation until the first message was applied.
    pub bootstrap: Option<Duration>,
}

#[derive(Debug)]
pub struct MessageHandler {
    state: HandlerState,
    next_expected: u64,
    initial_handled: bool,
    awaiting_snapshot: bool,
    buffer: BTreeMap<u64, ChangeMessage>,
    max_buffered: usize,
    max_gap_retries: u32,
    gap_attempts: u32,
    gap_fill_pending: bool,
    stats: ProcessingStats,
    created_at: Instant,
}

impl MessageHandler {
    #[must_use]
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            state: HandlerState::Idle,
            next_expected: config.initial_sequence_id,
            initial_handled: false,
            awaiting_snapshot: false,
            buffer: BTreeMap::new(),
            max_buffered: config.max_buffered_messages.max(1),
            max_gap_retries: config.max_gap_retries,
            gap_attempts: 0,
            gap_fill_pending: false,
            stats: ProcessingStats::default(),
            created_at: Instant::now(),
        }
    }

    pub fn set_limits(&mut self, max_buffered: usize, max_gap_retries: u32) {
        self.max_buffered = max_buffered.max(1);
        self.max_gap_retries = max_gap_retries;
    }

    #[must_use]
    pub fn state(&self) -> HandlerState {
        self.state
    }

    #[must_use]
    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    /// Last applied sequence id, once anything has been applied.
    #[must_use]
    pub fn last_processed(&self) -> Option<u64> {
        self.initial_handled.then(|| self.next_expected - 1)
    }

    #[must_use]
    pub fn initial_message_handled(&self) -> bool {
        self.initial_handled
    }

    #[must_use]
    pub fn is_awaiting_snapshot(&self) -> bool {
        self.awaiting_snapshot
    }

    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    #[must_use]
    pub fn buffered_ids(&self) -> Vec<u64> {
        self.buffer.keys().copied().collect()
    }

    #[must_use]
    pub fn gap_attempts(&self) -> u32 {
        self.gap_attempts
    }

    /// Whether a reported missing range has not been answered yet.
    #[must_use]
    pub fn is_gap_fill_pending(&self) -> bool {
        self.gap_fill_pending
    }

    #[must_use]
    pub fn stats(&self) -> &ProcessingStats {
        &self.stats
    }

    pub fn on_request_sent(&mut self) {
        if self.state != HandlerState::Disconnected {
            self.state = HandlerState::AwaitingResponse;
        }
    }

    pub fn on_response_complete(&mut self) {
        if self.state == HandlerState::AwaitingResponse {
            self.state = HandlerState::Idle;
        }
    }

    pub fn on_disconnected(&mut self) {
        self.state = HandlerState::Disconnected;
    }

    pub fn on_reconnected(&mut self) {
        self.state = HandlerState::Idle;
    }

    /// A snapshot has been requested: stop issuing gap fills and drop the
    /// buffer, which the snapshot supersedes.
    pub fn expect_snapshot(&mut self, reason: ResyncReason) {
        if !self.awaiting_snapshot {
            info!(reason = reason.as_str(), "Awaiting full resynchronization");
            crate::metrics::record_resync(reason.as_str());
        }
        self.awaiting_snapshot = true;
        self.gap_attempts = 0;
        self.gap_fill_pending = false;
        self.clear_buffer();
    }

    /// The response to a gap-fill request has been processed.
    pub fn on_gap_fill_answered(&mut self) -> GapFillOutcome {
        self.gap_fill_pending = false;
        if self.awaiting_snapshot || self.buffer.is_empty() {
            return GapFillOutcome::Closed;
        }
        self.gap_attempts += 1;
        if self.gap_attempts > self.max_gap_retries {
            warn!(attempts = self.gap_attempts, expected = self.next_expected, "Gap not filled in time");
            self.expect_snapshot(ResyncReason::GapBudgetExceeded);
            return GapFillOutcome::NeedsFullResync;
        }
        match self.missing_range() {
            Some(missing) => {
                debug!(missing = ?missing, attempt = self.gap_attempts, "Gap still open, asking again");
                self.gap_fill_pending = true;
                GapFillOutcome::Retry(missing)
            }
            None => GapFillOutcome::Closed,
        }
    }

    /// Handle one inbound message.
    pub fn handle(&mut self, tree: &mut StateTree, message: ChangeMessage) -> HandleOutcome {
        let outcome = if message.resync {
            self.handle_snapshot(tree, message)
        } else {
            self.handle_incremental(tree, message)
        };
        crate::metrics::record_message(outcome_label(&outcome));
        crate::metrics::set_buffered_messages(self.buffer.len());
        crate::metrics::set_tree_nodes(tree.len());
        outcome
    }

    fn handle_incremental(&mut self, tree: &mut StateTree, message: ChangeMessage) -> HandleOutcome {
        let seq = message.sequence_id;
        if seq < self.next_expected {
            debug!(seq, expected = self.next_expected, "Dropping duplicate message");
            return HandleOutcome::Duplicate;
        }

        if seq > self.next_expected {
            return self.buffer_message(message);
        }

        if let Err(e) = self.apply(tree, &message) {
            return self.fail(&e);
        }
        match self.replay_buffered(tree) {
            Ok(replayed) => HandleOutcome::Applied {
                through: self.next_expected - 1,
                messages: replayed + 1,
            },
            Err(e) => self.fail(&e),
        }
    }

    fn buffer_message(&mut self, message: ChangeMessage) -> HandleOutcome {
        let seq = message.sequence_id;
        if self.buffer.contains_key(&seq) {
            return HandleOutcome::Duplicate;
        }
        if self.buffer.len() >= self.max_buffered {
            warn!(seq, limit = self.max_buffered, "Out-of-order buffer full");
            self.expect_snapshot(ResyncReason::BufferOverflow);
            return HandleOutcome::NeedsFullResync {
                reason: ResyncReason::BufferOverflow,
            };
        }
        self.buffer.insert(seq, message);
        let missing = self.take_gap_fill_request();
        debug!(seq, missing = ?missing, buffered = self.buffer.len(), "Buffered out-of-order message");
        HandleOutcome::Buffered { missing }
    }

    /// The range to ask for when a gap is open and nobody has asked yet.
    ///
    /// Nothing is asked for before the initial message has been handled or
    /// while a snapshot is on its way.
    pub fn take_gap_fill_request(&mut self) -> Option<RangeInclusive<u64>> {
        if self.awaiting_snapshot || !self.initial_handled || self.gap_fill_pending {
            return None;
        }
        let missing = self.missing_range()?;
        self.gap_fill_pending = true;
        Some(missing)
    }

    /// Ids between the next expected one and the first buffered message.
    fn missing_range(&self) -> Option<RangeInclusive<u64>> {
        let first_buffered = *self.buffer.keys().next()?;
        (first_buffered > self.next_expected).then(|| self.next_expected..=first_buffered - 1)
    }

    fn handle_snapshot(&mut self, tree: &mut StateTree, message: ChangeMessage) -> HandleOutcome {
        let seq = message.sequence_id;
        if seq < self.next_expected && !self.awaiting_snapshot {
            debug!(seq, "Dropping stale snapshot");
            return HandleOutcome::Duplicate;
        }

        let next_expected = match successor(seq) {
            Ok(next) => next,
            Err(e) => return self.fail(&e),
        };
        let timer = LatencyTimer::new();
        if let Err(e) = tree.replace_with_snapshot(&message.changes) {
            let err = SyncError::ordering(e);
            return self.fail(&err);
        }
        self.record_applied(timer.elapsed());
        self.next_expected = next_expected;
        self.awaiting_snapshot = false;
        self.gap_attempts = 0;
        self.gap_fill_pending = false;
        self.buffer.retain(|id, _| *id > seq);
        info!(seq, nodes = tree.len(), "Applied full snapshot");

        match self.replay_buffered(tree) {
            Ok(replayed) => HandleOutcome::Resynchronized {
                sequence_id: seq,
                replayed,
            },
            Err(e) => self.fail(&e),
        }
    }

    fn replay_buffered(&mut self, tree: &mut StateTree) -> Result<usize, SyncError> {
        let mut replayed = 0;
        while let Some(message) = self.buffer.remove(&self.next_expected) {
            self.apply(tree, &message)?;
            replayed += 1;
        }
        // Anything still buffered is older than what we just applied.
        let expected = self.next_expected;
        self.buffer.retain(|id, _| *id > expected);
        if self.buffer.is_empty() {
            self.gap_attempts = 0;
            self.gap_fill_pending = false;
        }
        Ok(replayed)
    }

    fn apply(&mut self, tree: &mut StateTree, message: &ChangeMessage) -> Result<(), SyncError> {
        let next_expected = successor(message.sequence_id)?;
        let timer = LatencyTimer::new();
        let applied = tree
            .apply_changes(&message.changes)
            .map_err(SyncError::ordering)?;
        tree.purge_detached();
        self.next_expected = next_expected;
        self.record_applied(timer.elapsed());
        crate::metrics::record_changes_applied(applied);
        Ok(())
    }

    fn record_applied(&mut self, elapsed: Duration) {
        self.stats.last_processing = elapsed;
        self.stats.total_processing += elapsed;
        self.stats.messages_applied += 1;
        if !self.initial_handled {
            self.initial_handled = true;
            let bootstrap = self.created_at.elapsed();
            self.stats.bootstrap = Some(bootstrap);
            info!(bootstrap = ?bootstrap, "Initial message handled");
        }
    }

    fn fail(&mut self, err: &SyncError) -> HandleOutcome {
        warn!(error = %err, "Failed to apply change message");
        crate::metrics::record_error(err.kind().as_str(), "apply");
        self.expect_snapshot(ResyncReason::ProtocolError);
        HandleOutcome::NeedsFullResync {
            reason: ResyncReason::ProtocolError,
        }
    }

    fn clear_buffer(&mut self) {
        if !self.buffer.is_empty() {
            debug!(dropped = self.buffer.len(), "Discarding out-of-order buffer");
            self.buffer.clear();
        }
    }
}

fn successor(seq: u64) -> Result<u64, SyncError> {
    seq.checked_add(1)
        .ok_or_else(|| SyncError::ProtocolOrdering(format!("sequence id {seq} has no successor")))
}

fn outcome_label(outcome: &HandleOutcome) -> &'static str {
    match outcome {
        HandleOutcome::Applied { .. } => "applied",
        HandleOutcome::Buffered { .. } => "buffered",
        HandleOutcome::Duplicate => "duplicate",
        HandleOutcome::Resynchronized { .. } => "snapshot",
        HandleOutcome::NeedsFullResync { .. } => "resync_needed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{NodeChange, NodeId};
    use serde_json::json;

    const A: NodeId = NodeId(2);

    fn handler() -> MessageHandler {
        MessageHandler::new(&SyncConfig::default())
    }

    fn create_a() -> ChangeMessage {
        ChangeMessage::new(
            1,
            vec![
                NodeChange::attach(A, NodeId::ROOT),
                NodeChange::put(A, "text", json!("hi")),
            ],
        )
    }

    fn set_text(seq: u64, text: &str) -> ChangeMessage {
        ChangeMessage::new(seq, vec![NodeChange::put(A, "text", json!(text))])
    }

    #[test]
    fn test_in_order_messages_apply() {
        let mut handler = handler();
        let mut tree = StateTree::new();
        assert!(!handler.initial_message_handled());

        let outcome = handler.handle(&mut tree, create_a());
        assert_eq!(outcome, HandleOutcome::Applied { through: 1, messages: 1 });
        assert!(handler.initial_message_handled());
        assert_eq!(tree.root().children(), &[A]);
        assert_eq!(tree.node(A).unwrap().text(), Some("hi"));
        assert_eq!(handler.last_processed(), Some(1));
        assert!(handler.stats().bootstrap.is_some());
    }

    #[test]
    fn test_duplicate_is_a_no_op() {
        let mut handler = handler();
        let mut tree = StateTree::new();
        handler.handle(&mut tree, create_a());
        handler.handle(&mut tree, set_text(2, "renamed"));
        let before = tree.debug_dump();

        assert_eq!(handler.handle(&mut tree, set_text(2, "renamed")), HandleOutcome::Duplicate);
        assert_eq!(handler.handle(&mut tree, create_a()), HandleOutcome::Duplicate);
        assert_eq!(tree.debug_dump(), before);
        assert_eq!(handler.stats().messages_applied, 2);
    }

    #[test]
    fn test_gap_is_buffered_then_replayed() {
        let mut handler = handler();
        let mut tree = StateTree::new();
        handler.handle(&mut tree, create_a());

        let outcome = handler.handle(&mut tree, set_text(3, "third"));
        assert_eq!(outcome, HandleOutcome::Buffered { missing: Some(2..=2) });
        assert_eq!(tree.node(A).unwrap().text(), Some("hi"));
        assert_eq!(handler.buffered_ids(), vec![3]);

        let outcome = handler.handle(&mut tree, set_text(2, "second"));
        assert_eq!(outcome, HandleOutcome::Applied { through: 3, messages: 2 });
        assert_eq!(tree.node(A).unwrap().text(), Some("third"));
        assert_eq!(handler.buffered_len(), 0);
        assert_eq!(handler.gap_attempts(), 0);
    }

    #[test]
    fn test_gap_budget_exhaustion_requests_snapshot() {
        let config = SyncConfig {
            max_gap_retries: 2,
            ..Default::default()
        };
        let mut handler = MessageHandler::new(&config);
        let mut tree = StateTree::new();
        handler.handle(&mut tree, create_a());

        assert_eq!(
            handler.handle(&mut tree, set_text(3, "c")),
            HandleOutcome::Buffered { missing: Some(2..=2) }
        );
        assert!(handler.is_gap_fill_pending());

        // Each answer that leaves the gap open uses one attempt.
        assert_eq!(handler.on_gap_fill_answered(), GapFillOutcome::Retry(2..=2));
        assert_eq!(handler.on_gap_fill_answered(), GapFillOutcome::Retry(2..=2));
        assert_eq!(handler.gap_attempts(), 2);
        assert_eq!(handler.on_gap_fill_answered(), GapFillOutcome::NeedsFullResync);
        assert_eq!(handler.buffered_len(), 0);
        assert!(handler.is_awaiting_snapshot());

        // While the snapshot is on its way, no further gap fills are asked for.
        assert_eq!(
            handler.handle(&mut tree, set_text(7, "g")),
            HandleOutcome::Buffered { missing: None }
        );
        assert_eq!(handler.take_gap_fill_request(), None);
    }

    #[test]
    fn test_burst_behind_one_lost_message_waits_for_the_gap_fill() {
        let config = SyncConfig {
            max_gap_retries: 2,
            ..Default::default()
        };
        let mut handler = MessageHandler::new(&config);
        let mut tree = StateTree::new();
        handler.handle(&mut tree, create_a());

        assert_eq!(
            handler.handle(&mut tree, set_text(3, "c")),
            HandleOutcome::Buffered { missing: Some(2..=2) }
        );
        for seq in 4..=6 {
            assert_eq!(
                handler.handle(&mut tree, set_text(seq, "later")),
                HandleOutcome::Buffered { missing: None }
            );
        }
        assert_eq!(handler.buffered_ids(), vec![3, 4, 5, 6]);
        assert_eq!(handler.gap_attempts(), 0);
        assert!(!handler.is_awaiting_snapshot());

        assert_eq!(
            handler.handle(&mut tree, set_text(2, "b")),
            HandleOutcome::Applied { through: 6, messages: 5 }
        );
        assert_eq!(handler.on_gap_fill_answered(), GapFillOutcome::Closed);
        assert!(!handler.is_gap_fill_pending());
        assert_eq!(tree.node(A).unwrap().text(), Some("later"));
    }

    #[test]
    fn test_gap_left_after_snapshot_is_requested() {
        let mut handler = handler();
        let mut tree = StateTree::new();
        handler.handle(&mut tree, create_a());
        handler.expect_snapshot(ResyncReason::ProtocolError);
        assert_eq!(
            handler.handle(&mut tree, set_text(8, "late")),
            HandleOutcome::Buffered { missing: None }
        );

        let snapshot = ChangeMessage::snapshot(5, vec![NodeChange::attach(A, NodeId::ROOT)]);
        assert!(matches!(
            handler.handle(&mut tree, snapshot),
            HandleOutcome::Resynchronized { replayed: 0, .. }
        ));
        assert_eq!(handler.take_gap_fill_request(), Some(6..=7));
        assert_eq!(handler.take_gap_fill_request(), None);
    }

    #[test]
    fn test_last_sequence_id_is_a_protocol_error() {
        let mut handler = handler();
        let mut tree = StateTree::new();
        let snapshot = ChangeMessage::snapshot(u64::MAX, vec![]);
        assert_eq!(
            handler.handle(&mut tree, snapshot),
            HandleOutcome::NeedsFullResync {
                reason: ResyncReason::ProtocolError
            }
        );
        assert!(!handler.initial_message_handled());

        let mut handler = MessageHandler::new(&SyncConfig {
            initial_sequence_id: u64::MAX,
            ..Default::default()
        });
        assert_eq!(
            handler.handle(&mut tree, ChangeMessage::new(u64::MAX, vec![])),
            HandleOutcome::NeedsFullResync {
                reason: ResyncReason::ProtocolError
            }
        );
        assert_eq!(handler.next_expected(), u64::MAX);
    }

    #[test]
    fn test_buffer_overflow_requests_snapshot() {
        let config = SyncConfig {
            max_buffered_messages: 2,
            max_gap_retries: 10,
            ..Default::default()
        };
        let mut handler = MessageHandler::new(&config);
        let mut tree = StateTree::new();
        handler.handle(&mut tree, create_a());

        handler.handle(&mut tree, set_text(3, "c"));
        handler.handle(&mut tree, set_text(4, "d"));
        assert_eq!(
            handler.handle(&mut tree, set_text(5, "e")),
            HandleOutcome::NeedsFullResync {
                reason: ResyncReason::BufferOverflow
            }
        );
    }

    #[test]
    fn test_snapshot_replaces_state_and_keeps_newer_buffer() {
        let mut handler = handler();
        let mut tree = StateTree::new();
        handler.handle(&mut tree, create_a());
        handler.expect_snapshot(ResyncReason::GapBudgetExceeded);

        // Newer than the coming snapshot: kept.
        handler.handle(&mut tree, set_text(6, "after"));

        let b = NodeId(9);
        let snapshot = ChangeMessage::snapshot(
            5,
            vec![
                NodeChange::attach(A, NodeId::ROOT),
                NodeChange::attach(b, NodeId::ROOT),
                NodeChange::put(A, "text", json!("snap")),
            ],
        );
        let outcome = handler.handle(&mut tree, snapshot);
        assert_eq!(
            outcome,
            HandleOutcome::Resynchronized {
                sequence_id: 5,
                replayed: 1
            }
        );
        assert_eq!(tree.root().children(), &[A, b]);
        assert_eq!(tree.node(A).unwrap().text(), Some("after"));
        assert_eq!(handler.next_expected(), 7);
        assert!(!handler.is_awaiting_snapshot());
    }

    #[test]
    fn test_unknown_node_is_protocol_error() {
        let mut handler = handler();
        let mut tree = StateTree::new();
        let bogus = ChangeMessage::new(1, vec![NodeChange::put(NodeId(42), "text", json!("x"))]);

        assert_eq!(
            handler.handle(&mut tree, bogus),
            HandleOutcome::NeedsFullResync {
                reason: ResyncReason::ProtocolError
            }
        );
        assert!(handler.is_awaiting_snapshot());
        assert!(!handler.initial_message_handled());
    }

    #[test]
    fn test_state_transitions() {
        let mut handler = handler();
        assert_eq!(handler.state(), HandlerState::Idle);
        handler.on_request_sent();
        assert_eq!(handler.state(), HandlerState::AwaitingResponse);
        handler.on_response_complete();
        assert_eq!(handler.state(), HandlerState::Idle);

        handler.on_disconnected();
        handler.on_request_sent();
        assert_eq!(handler.state(), HandlerState::Disconnected);
        handler.on_reconnected();
        assert_eq!(handler.state(), HandlerState::Idle);
    }
}
