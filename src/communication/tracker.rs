// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Single-flight request discipline.
//!
//! At most one request is outstanding at a time. The only way past an
//! outstanding request is [`RequestResponseTracker::start_resync_request`],
//! which supersedes it. A request whose response never shows up is reclaimed
//! by [`RequestResponseTracker::take_overdue`] instead of latching the tracker.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::SyncError;

pub type RequestId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub id: RequestId,
    pub started_at: Instant,
    pub resync: bool,
}

#[derive(Debug)]
pub struct RequestResponseTracker {
    active: Option<PendingRequest>,
    next_id: RequestId,
    idle_tx: watch::Sender<bool>,
}

impl Default for RequestResponseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestResponseTracker {
    #[must_use]
    pub fn new() -> Self {
        let (idle_tx, _) = watch::channel(true);
        Self {
            active: None,
            next_id: 1,
            idle_tx,
        }
    }

    /// Begin a request. Fails with [`SyncError::AlreadyActive`] while another
    /// one is outstanding.
    pub fn start_request(&mut self, now: Instant) -> Result<RequestId, SyncError> {
        if let Some(active) = self.active {
            warn!(active = active.id, "Refusing to start a second request");
            return Err(SyncError::AlreadyActive);
        }
        Ok(self.begin(now, false))
    }

    /// Begin a resynchronization request, superseding any outstanding one.
    pub fn start_resync_request(&mut self, now: Instant) -> (RequestId, Option<PendingRequest>) {
        let superseded = self.active.take();
        if let Some(old) = superseded {
            debug!(superseded = old.id, "Resync request overrides outstanding request");
        }
        (self.begin(now, true), superseded)
    }

    /// Complete request `id`. Completions for superseded or reclaimed
    /// requests are ignored and return false.
    pub fn end_request(&mut self, id: RequestId) -> bool {
        match self.active {
            Some(active) if active.id == id => {
                self.active = None;
                self.idle_tx.send_replace(true);
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn has_active_request(&self) -> bool {
        self.active.is_some()
    }

    #[must_use]
    pub fn active(&self) -> Option<PendingRequest> {
        self.active
    }

    /// When the outstanding request will be considered lost.
    #[must_use]
    pub fn deadline(&self, timeout: Duration) -> Option<Instant> {
        self.active.map(|a| a.started_at + timeout)
    }

    /// Reclaim the outstanding request if it is older than `timeout`.
    pub fn take_overdue(&mut self, now: Instant, timeout: Duration) -> Option<PendingRequest> {
        let active = self.active?;
        if now.saturating_duration_since(active.started_at) < timeout {
            return None;
        }
        warn!(request = active.id, timeout = ?timeout, "Request lost: no response before deadline");
        self.abandon()
    }

    /// Drop the outstanding request without a response (connection lost).
    pub fn abandon(&mut self) -> Option<PendingRequest> {
        let abandoned = self.active.take();
        if abandoned.is_some() {
            self.idle_tx.send_replace(true);
        }
        abandoned
    }

    /// Watch that holds `true` whenever nothing is in flight.
    #[must_use]
    pub fn subscribe_idle(&self) -> watch::Receiver<bool> {
        self.idle_tx.subscribe()
    }

    fn begin(&mut self, now: Instant, resync: bool) -> RequestId {
        let id = self.next_id;
        self.next_id += 1;
        self.active = Some(PendingRequest {
            id,
            started_at: now,
            resync,
        });
        self.idle_tx.send_replace(false);
        id
    }
}

/// Resolve once `idle` reports no request in flight.
pub async fn wait_for_quiescence(idle: &mut watch::Receiver<bool>) {
    // A closed channel means the tracker is gone, which is as idle as it gets.
    let _ = idle.wait_for(|idle| *idle).await;
}
