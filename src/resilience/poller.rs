// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic zero-payload requests.
//!
//! Polling carries server-side changes to a client without a push channel.
//! The interval comes from configuration unless the session overrides it
//! through the root node's `pollInterval` feature. Polling only runs while
//! the connection is up.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::scheduler::CancellableTimer;
use crate::tree::{features, StateTree};

#[derive(Debug, Default)]
pub struct Poller {
    configured: Option<Duration>,
    /// Set once the session has published an interval (inner `None` = off).
    server: Option<Option<Duration>>,
    timer: CancellableTimer,
    suspended: bool,
}

impl Poller {
    #[must_use]
    pub fn new(configured: Option<Duration>) -> Self {
        Self {
            configured,
            ..Self::default()
        }
    }

    /// Server-published interval if any, otherwise the configured one.
    #[must_use]
    pub fn interval(&self) -> Option<Duration> {
        self.server.unwrap_or(self.configured)
    }

    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    pub fn set_configured(&mut self, interval: Option<Duration>, now: Instant) {
        if self.configured != interval {
            self.configured = interval;
            self.reschedule(now);
        }
    }

    /// Pick up the root node's `pollInterval` (milliseconds; zero or
    /// negative disables polling). Once the feature is removed the
    /// configured interval applies again.
    pub fn update_from_tree(&mut self, tree: &StateTree, now: Instant) {
        let published = tree.root().millis(features::POLL_INTERVAL);
        if published != self.server {
            debug!(interval = ?published.flatten(), "Session changed poll interval");
            self.server = published;
            self.reschedule(now);
        }
    }

    /// Stop polling (connection down).
    pub fn suspend(&mut self) {
        self.suspended = true;
        self.timer.cancel();
    }

    /// Resume polling one interval from `now`.
    pub fn resume(&mut self, now: Instant) {
        self.suspended = false;
        self.reschedule(now);
    }

    /// True when a poll should be issued. The next tick is armed right away;
    /// the caller skips the poll if a request is already in flight.
    pub fn due(&mut self, now: Instant) -> bool {
        if !self.timer.fire(now) {
            return false;
        }
        self.reschedule(now);
        true
    }

    pub fn shut_down(&mut self) {
        self.timer.shut_down();
    }

    fn reschedule(&mut self, now: Instant) {
        match self.interval() {
            Some(interval) if !self.suspended => self.timer.arm(now + interval),
            _ => self.timer.cancel(),
        }
    }
}
