// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The explicit context object of one client connection.
//!
//! Every component is a field here, constructed in dependency order:
//!
//! ```text
//! tree → tracker / handler / sender / loading → connection / poller / heartbeat → scheduler → binder
//! ```
//!
//! [`SyncContext::teardown`] runs in the reverse order. All methods are
//! synchronous and take the current time, so the async run loop only has to
//! hold the lock for one step at a time and never across an `.await`.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::types::{ProfilingData, TreeUpdate};
use crate::binding::Binder;
use crate::communication::{
    GapFillOutcome, HandleOutcome, LoadingDelays, LoadingIndicator, LoadingState, MessageHandler,
    MessageSender, RequestId, RequestResponseTracker, ResyncReason,
};
use crate::config::SyncConfig;
use crate::error::{ErrorSink, SyncError};
use crate::protocol::{codec, ChangeMessage, RequestKind, SyncRequest};
use crate::resilience::{ConnectionStateMachine, Heartbeat, Poller, ResumeMode};
use crate::scheduler::{DeferredBatch, DeferredScheduler};
use crate::transport::TransportError;
use crate::tree::StateTree;

pub type ChangeObserver = Arc<dyn Fn(TreeUpdate) + Send + Sync>;

/// An encoded request ready to hand to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub request_id: RequestId,
    pub client_id: u64,
    pub payload: String,
    /// An in-flight request was overridden; its future must be dropped.
    pub superseded: bool,
}

/// What the run loop has to do after a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Effects {
    pub cancel_request: bool,
    pub start_heartbeat: bool,
    pub start_handshake: bool,
}

pub struct SyncContext {
    pub(super) config: SyncConfig,
    pub(super) tree: StateTree,
    pub(super) tracker: RequestResponseTracker,
    pub(super) handler: MessageHandler,
    pub(super) sender: MessageSender,
    pub(super) loading: LoadingIndicator,
    pub(super) connection: ConnectionStateMachine,
    pub(super) poller: Poller,
    pub(super) heartbeat: Heartbeat,
    pub(super) scheduler: DeferredScheduler,
    pub(super) binder: Option<Binder>,
    pub(super) observers: Vec<ChangeObserver>,
    pub(super) sink: ErrorSink,
    started: bool,
    torn_down: bool,
    requests_sent: u64,
    resyncs: u64,
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("nodes", &self.tree.len())
            .field("tracker", &self.tracker)
            .field("handler", &self.handler)
            .field("connection", &self.connection.state())
            .field("torn_down", &self.torn_down)
            .finish_non_exhaustive()
    }
}

impl SyncContext {
    pub fn new(config: SyncConfig, sink: ErrorSink) -> Self {
        let tree = StateTree::new();
        let tracker = RequestResponseTracker::new();
        let handler = MessageHandler::new(&config);
        let sender = MessageSender::new();
        let loading = LoadingIndicator::new(LoadingDelays::from_config(&config));
        let connection = ConnectionStateMachine::new(config.reconnect_policy(), config.resync_after());
        let poller = Poller::new(config.poll_interval());
        let heartbeat = Heartbeat::new(config.heartbeat_interval());
        let scheduler = DeferredScheduler::new();
        Self {
            config,
            tree,
            tracker,
            handler,
            sender,
            loading,
            connection,
            poller,
            heartbeat,
            scheduler,
            binder: None,
            observers: Vec::new(),
            sink,
            started: false,
            torn_down: false,
            requests_sent: 0,
            resyncs: 0,
        }
    }

    #[must_use]
    pub fn tree(&self) -> &StateTree {
        &self.tree
    }

    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// The activity predicate. Evaluated fresh on every call.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.handler.initial_message_handled()
            || self.tracker.has_active_request()
            || self.scheduler.has_work_queued()
            || self.has_unsent_work()
    }

    /// Queued requests, or a sent one that still has to be answered
    /// (possibly after a reconnect). Nothing counts once recovery is over.
    fn has_unsent_work(&self) -> bool {
        !self.torn_down
            && !self.connection.is_failed()
            && (self.sender.has_pending() || self.sender.has_unacknowledged())
    }

    /// Loading indicator stage for the request currently in flight.
    #[must_use]
    pub fn loading_state(&self, now: Instant) -> LoadingState {
        let busy_since = self.tracker.active().map(|active| active.started_at);
        self.loading.state(busy_since, now)
    }

    #[must_use]
    pub fn profiling_data(&self) -> ProfilingData {
        ProfilingData {
            processing: self.handler.stats().clone(),
            requests_sent: self.requests_sent,
            resyncs: self.resyncs,
            buffered_messages: self.handler.buffered_len(),
            tree_nodes: self.tree.len(),
        }
    }

    /// Begin synchronizing. With an initial payload (an encoded response)
    /// the client bootstraps from it; otherwise it asks for a snapshot.
    pub fn start(&mut self, initial: Option<&str>, now: Instant) -> Result<(), SyncError> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        self.poller.resume(now);
        self.heartbeat.schedule(now);
        match initial {
            Some(payload) => {
                let response = codec::decode_response(payload)?;
                for message in response.messages {
                    self.process_message(message, now);
                }
            }
            None => self.request_full_resync(ResyncReason::Startup),
        }
        Ok(())
    }

    /// Build and register the next request, if one may go out now.
    pub fn next_outbound(&mut self, now: Instant) -> Option<Outbound> {
        if !self.started || self.torn_down || !self.connection.is_connected() {
            return None;
        }
        if self.sender.resync_requested() {
            if self.tracker.active().is_some_and(|active| active.resync) {
                return None;
            }
        } else if self.tracker.has_active_request() {
            return None;
        }

        let request = self.sender.next_request(self.handler.last_processed())?;
        let (request_id, superseded) = if request.kind == RequestKind::Resynchronize {
            let (id, superseded) = self.tracker.start_resync_request(now);
            (id, superseded.is_some())
        } else {
            match self.tracker.start_request(now) {
                Ok(id) => (id, false),
                Err(e) => {
                    self.sink.report(&e);
                    return None;
                }
            }
        };

        let payload = match codec::encode_request(&request) {
            Ok(payload) => payload,
            Err(e) => {
                self.tracker.end_request(request_id);
                self.sink.report(&e.into());
                return None;
            }
        };
        self.handler.on_request_sent();
        self.requests_sent += 1;
        crate::metrics::record_request(request_label(&request));
        Some(Outbound {
            request_id,
            client_id: request.client_id,
            payload,
            superseded,
        })
    }

    /// A response arrived for `request_id`.
    pub fn on_response(&mut self, request_id: RequestId, client_id: u64, payload: &str, now: Instant) {
        let started_at = self.tracker.active().map(|a| a.started_at);
        if !self.tracker.end_request(request_id) {
            debug!(request_id, "Ignoring response to a superseded request");
            return;
        }
        if let Some(started_at) = started_at {
            crate::metrics::record_request_latency(now.saturating_duration_since(started_at));
        }
        let answered = self.sender.acknowledge(client_id);
        self.handler.on_response_complete();
        self.process_payload(payload, now);
        if answered.is_some_and(|request| is_gap_fill(&request)) {
            self.after_gap_fill();
        }
    }

    /// The transport failed a request.
    pub fn on_request_failed(&mut self, request_id: RequestId, err: TransportError, now: Instant) -> Effects {
        if self.tracker.active().map(|a| a.id) != Some(request_id) {
            return Effects::default();
        }
        match err {
            TransportError::Rejected(reason) => {
                // The peer will never accept this payload; do not resend it.
                self.tracker.end_request(request_id);
                let rejected = self.sender.take_unacknowledged();
                self.handler.on_response_complete();
                self.sink.report(&SyncError::Transport(TransportError::Rejected(reason)));
                if rejected.is_some_and(|request| is_gap_fill(&request)) {
                    self.after_gap_fill();
                }
                Effects::default()
            }
            other => self.lose_connection(now, &other.to_string()),
        }
    }

    /// A server-initiated message arrived on the push channel.
    pub fn on_push(&mut self, payload: &str, now: Instant) {
        if self.torn_down {
            return;
        }
        self.process_payload(payload, now);
    }

    /// Fire whatever timers are due.
    pub fn on_timers(&mut self, now: Instant) -> Result<Effects, SyncError> {
        let mut effects = Effects::default();
        if self.torn_down {
            return Ok(effects);
        }

        if self
            .tracker
            .take_overdue(now, self.config.request_timeout())
            .is_some()
        {
            effects = self.lose_connection(now, "request timed out");
        }

        match self.connection.poll_reconnect(now) {
            Some(Ok(())) => effects.start_handshake = true,
            Some(Err(fatal)) => {
                self.on_permanent_failure();
                return Err(fatal);
            }
            None => {}
        }

        if self.poller.due(now) && self.connection.is_connected() {
            if self.tracker.has_active_request() {
                debug!("Skipping poll: request in flight");
            } else {
                self.sender.request_poll();
            }
        }

        if self.connection.is_connected() && self.heartbeat.due(now) {
            effects.start_heartbeat = true;
        }
        Ok(effects)
    }

    pub fn on_heartbeat_result(&mut self, result: Result<(), TransportError>, now: Instant) -> Effects {
        if !self.connection.is_connected() {
            return Effects::default();
        }
        match result {
            Ok(()) => {
                self.heartbeat.record_success(now);
                Effects::default()
            }
            Err(e) => {
                let failures = self.heartbeat.record_failure();
                warn!(failures, error = %e, "Missed heartbeat");
                self.lose_connection(now, "missed heartbeat")
            }
        }
    }

    pub fn on_handshake_result(&mut self, result: Result<(), TransportError>, now: Instant) -> Result<(), SyncError> {
        if self.torn_down {
            return Ok(());
        }
        match result {
            Ok(()) => {
                let mode = self.connection.on_handshake_ok(now);
                self.handler.on_reconnected();
                self.poller.resume(now);
                self.heartbeat.schedule(now);
                match mode {
                    ResumeMode::Resume => {
                        if !self.sender.requeue_unacknowledged() {
                            // Catch up on anything pushed while offline.
                            self.sender.request_poll();
                        }
                    }
                    ResumeMode::FullResync => self.request_full_resync(ResyncReason::LongDowntime),
                }
                Ok(())
            }
            Err(e) => {
                debug!(error = %e, "Handshake failed");
                match self.connection.on_attempt_failed(now) {
                    Ok(_) => Ok(()),
                    Err(fatal) => {
                        self.on_permanent_failure();
                        Err(fatal)
                    }
                }
            }
        }
    }

    /// Earliest timer deadline the run loop has to wake up for.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.tracker.deadline(self.config.request_timeout()),
            self.connection.reconnect_deadline(),
            self.poller.deadline(),
            self.heartbeat.deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Ask the session for a full snapshot.
    pub fn request_full_resync(&mut self, reason: ResyncReason) {
        self.handler.expect_snapshot(reason);
        self.sender.request_resync();
    }

    /// Deferred work queued so far; run it outside the lock.
    pub fn take_deferred(&mut self) -> DeferredBatch {
        self.scheduler.take_batch()
    }

    pub fn apply_config(&mut self, config: SyncConfig, now: Instant) {
        info!(
            poll_interval_ms = config.poll_interval_ms,
            heartbeat_interval_ms = config.heartbeat_interval_ms,
            "Config updated"
        );
        self.handler
            .set_limits(config.max_buffered_messages, config.max_gap_retries);
        let policy = config.reconnect_policy();
        self.connection.set_policy(policy.clone(), config.resync_after());
        self.connection.update_from_tree(&policy, &self.tree);
        self.loading
            .set_configured(LoadingDelays::from_config(&config), &self.tree);
        self.poller.set_configured(config.poll_interval(), now);
        if self.connection.is_connected() && self.heartbeat.interval() != config.heartbeat_interval() {
            self.heartbeat.set_interval(config.heartbeat_interval(), now);
        }
        self.config = config;
    }

    /// Tear everything down in reverse creation order. Idempotent.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if let Some(binder) = self.binder.as_mut() {
            binder.shut_down();
        }
        self.scheduler.clear();
        self.heartbeat.shut_down();
        self.poller.shut_down();
        self.connection.shut_down();
        self.sender.clear();
        self.handler.on_disconnected();
        self.tracker.abandon();
        info!("Sync context torn down");
    }

    fn process_payload(&mut self, payload: &str, now: Instant) {
        match codec::decode_response(payload) {
            Ok(response) => {
                for message in response.messages {
                    self.process_message(message, now);
                }
            }
            Err(e) => {
                self.sink.report(&e.into());
                self.request_full_resync(ResyncReason::ProtocolError);
            }
        }
    }

    fn process_message(&mut self, message: ChangeMessage, now: Instant) {
        match self.handler.handle(&mut self.tree, message) {
            HandleOutcome::Applied { through, .. } => self.after_apply(
                TreeUpdate {
                    last_sequence_id: through,
                    resynchronized: false,
                },
                now,
            ),
            HandleOutcome::Resynchronized { sequence_id, .. } => {
                self.resyncs += 1;
                let through = self.handler.last_processed().unwrap_or(sequence_id);
                self.after_apply(
                    TreeUpdate {
                        last_sequence_id: through,
                        resynchronized: true,
                    },
                    now,
                );
            }
            HandleOutcome::Buffered { missing: Some(range) } => {
                self.sender.request_resend(*range.start(), *range.end());
            }
            HandleOutcome::Buffered { missing: None } | HandleOutcome::Duplicate => {}
            HandleOutcome::NeedsFullResync { .. } => self.sender.request_resync(),
        }
        // Applying or a snapshot can leave newer messages behind a gap.
        if let Some(range) = self.handler.take_gap_fill_request() {
            self.sender.request_resend(*range.start(), *range.end());
        }
    }

    fn after_gap_fill(&mut self) {
        match self.handler.on_gap_fill_answered() {
            GapFillOutcome::Closed => {}
            GapFillOutcome::Retry(range) => self.sender.request_resend(*range.start(), *range.end()),
            GapFillOutcome::NeedsFullResync => self.sender.request_resync(),
        }
    }

    fn after_apply(&mut self, update: TreeUpdate, now: Instant) {
        if let Some(binder) = self.binder.as_mut() {
            if update.resynchronized {
                binder.rebuild(&self.tree);
            } else {
                binder.sync(&self.tree);
            }
        }
        self.poller.update_from_tree(&self.tree, now);
        self.connection
            .update_from_tree(&self.config.reconnect_policy(), &self.tree);
        self.loading.update_from_tree(&self.tree);
        for observer in &self.observers {
            let observer = Arc::clone(observer);
            self.scheduler.schedule(move || observer(update));
        }
    }

    fn lose_connection(&mut self, now: Instant, reason: &str) -> Effects {
        self.tracker.abandon();
        self.handler.on_disconnected();
        self.poller.suspend();
        self.heartbeat.stop();
        self.connection.on_connection_lost(now, reason);
        Effects {
            cancel_request: true,
            ..Effects::default()
        }
    }

    fn on_permanent_failure(&mut self) {
        self.poller.shut_down();
        self.heartbeat.shut_down();
        self.tracker.abandon();
        self.handler.on_disconnected();
    }
}

fn is_gap_fill(request: &SyncRequest) -> bool {
    matches!(request.kind, RequestKind::Resend { .. })
}

fn request_label(request: &SyncRequest) -> &'static str {
    match request.kind {
        RequestKind::Normal if request.events.is_empty() => "poll",
        RequestKind::Normal => "normal",
        RequestKind::Resend { .. } => "resend",
        RequestKind::Resynchronize => "resynchronize",
    }
}
