// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connection lifecycle state machine.
//!
//! ```text
//!              transport error /
//!              missed heartbeat          timer fired
//! Connected ─────────────────────▶ ConnectionLost ──────────▶ Reconnecting
//!     ▲                                                        │   │
//!     │                handshake ok                            │   │ attempt failed
//!     └────────────────────────────────────────────────────────┘   │ (re-arm timer)
//!                                                                  ▼
//!                                   budget exhausted ──▶ ReconnectFailedPermanently
//! ```
//!
//! The machine never sleeps: it arms a [`CancellableTimer`] whose deadline the
//! run loop waits on. State changes are broadcast on a `watch` channel so the
//! embedding application can show a "reconnecting" indicator or an error state.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use super::retry::ReconnectPolicy;
use crate::error::SyncError;
use crate::scheduler::CancellableTimer;
use crate::tree::{features, StateTree};

/// User-visible connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected = 0,
    ConnectionLost = 1,
    Reconnecting = 2,
    /// Terminal: no further automatic protocol activity.
    ReconnectFailedPermanently = 3,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => write!(f, "Connected"),
            Self::ConnectionLost => write!(f, "ConnectionLost"),
            Self::Reconnecting => write!(f, "Reconnecting"),
            Self::ReconnectFailedPermanently => write!(f, "ReconnectFailedPermanently"),
        }
    }
}

/// How to continue after a successful handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    /// Continue from the last acknowledged sequence id.
    Resume,
    /// Downtime was too long: discard incremental tracking, request a snapshot.
    FullResync,
}

#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    policy: ReconnectPolicy,
    resync_after: Duration,
    failed_attempts: u32,
    lost_at: Option<Instant>,
    reconnect_timer: CancellableTimer,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionStateMachine {
    #[must_use]
    pub fn new(policy: ReconnectPolicy, resync_after: Duration) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connected);
        Self {
            state: ConnectionState::Connected,
            policy,
            resync_after,
            failed_attempts: 0,
            lost_at: None,
            reconnect_timer: CancellableTimer::new(),
            state_tx,
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.state == ConnectionState::ReconnectFailedPermanently
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    #[must_use]
    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    #[must_use]
    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.reconnect_timer.deadline()
    }

    pub fn set_policy(&mut self, policy: ReconnectPolicy, resync_after: Duration) {
        self.policy = policy;
        self.resync_after = resync_after;
    }

    #[must_use]
    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Layer the root node's `reconnectAttempts` and `reconnectInterval`
    /// over `base`. A published interval replaces the backoff with a fixed
    /// delay.
    pub fn update_from_tree(&mut self, base: &ReconnectPolicy, tree: &StateTree) {
        let root = tree.root();
        let mut policy = base.clone();
        if let Some(attempts) = root
            .scalar(features::RECONNECT_ATTEMPTS)
            .and_then(serde_json::Value::as_f64)
            .filter(|n| n.is_finite())
        {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let limit = (attempts >= 0.0).then(|| attempts.round().min(f64::from(u32::MAX)) as u32);
            policy.max_attempts = limit;
        }
        if let Some(Some(interval)) = root.millis(features::RECONNECT_INTERVAL) {
            policy.initial_delay = interval;
            policy.max_delay = interval;
            policy.factor = 1.0;
        }
        if policy != self.policy {
            info!(
                max_attempts = ?policy.max_attempts,
                initial_delay = ?policy.initial_delay,
                "Reconnect policy updated"
            );
            self.policy = policy;
        }
    }

    /// Transport error or missed heartbeat. Returns false when the machine was
    /// not connected (already recovering, or failed for good).
    pub fn on_connection_lost(&mut self, now: Instant, reason: &str) -> bool {
        if self.state != ConnectionState::Connected {
            return false;
        }
        let delay = self.policy.delay_for_attempt(0);
        warn!(reason, retry_in = ?delay, "Connection lost");
        self.failed_attempts = 0;
        self.lost_at = Some(now);
        self.reconnect_timer.arm(now + delay);
        self.set_state(ConnectionState::ConnectionLost);
        true
    }

    /// Poll the reconnect timer.
    ///
    /// - `None`: nothing to do yet.
    /// - `Some(Ok(()))`: now `Reconnecting`; the caller starts a handshake.
    /// - `Some(Err(_))`: the budget is exhausted; the machine is terminal.
    pub fn poll_reconnect(&mut self, now: Instant) -> Option<Result<(), SyncError>> {
        if !self.reconnect_timer.fire(now) {
            return None;
        }
        if !self.policy.allows_attempt(self.failed_attempts, self.downtime(now)) {
            return Some(Err(self.give_up(now)));
        }
        info!(attempt = self.failed_attempts + 1, "Attempting reconnect");
        crate::metrics::record_reconnect("started");
        self.set_state(ConnectionState::Reconnecting);
        Some(Ok(()))
    }

    /// The handshake failed: back off again or give up.
    pub fn on_attempt_failed(&mut self, now: Instant) -> Result<Duration, SyncError> {
        if self.state == ConnectionState::ReconnectFailedPermanently {
            return Err(self.permanent_error(now));
        }
        self.failed_attempts += 1;
        crate::metrics::record_reconnect("failed");
        if !self.policy.allows_attempt(self.failed_attempts, self.downtime(now)) {
            return Err(self.give_up(now));
        }
        let delay = self.policy.delay_for_attempt(self.failed_attempts);
        warn!(attempts = self.failed_attempts, retry_in = ?delay, "Reconnect attempt failed");
        self.reconnect_timer.arm(now + delay);
        Ok(delay)
    }

    /// The handshake succeeded.
    pub fn on_handshake_ok(&mut self, now: Instant) -> ResumeMode {
        let downtime = self.downtime(now);
        let mode = if downtime > self.resync_after {
            ResumeMode::FullResync
        } else {
            ResumeMode::Resume
        };
        info!(downtime = ?downtime, attempts = self.failed_attempts, ?mode, "Reconnected");
        crate::metrics::record_reconnect("succeeded");
        self.reconnect_timer.cancel();
        self.failed_attempts = 0;
        self.lost_at = None;
        self.set_state(ConnectionState::Connected);
        mode
    }

    /// Cancel any pending reconnect for good.
    pub fn shut_down(&mut self) {
        self.reconnect_timer.shut_down();
    }

    fn downtime(&self, now: Instant) -> Duration {
        self.lost_at
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or_default()
    }

    fn give_up(&mut self, now: Instant) -> SyncError {
        self.reconnect_timer.shut_down();
        self.set_state(ConnectionState::ReconnectFailedPermanently);
        crate::metrics::record_reconnect("gave_up");
        let err = self.permanent_error(now);
        warn!(error = %err, "Giving up on reconnect");
        err
    }

    fn permanent_error(&self, now: Instant) -> SyncError {
        SyncError::PermanentReconnectFailure {
            attempts: self.failed_attempts,
            elapsed: self.downtime(now),
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        crate::metrics::set_connection_state(state as u8);
        self.state_tx.send_replace(state);
    }
}
