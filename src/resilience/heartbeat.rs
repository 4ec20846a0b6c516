// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transport liveness checks.

use std::time::Duration;

use tokio::time::Instant;

use crate::scheduler::CancellableTimer;

/// Heartbeat bookkeeping; the run loop does the actual probing.
#[derive(Debug, Default)]
pub struct Heartbeat {
    interval: Option<Duration>,
    timer: CancellableTimer,
    /// Consecutive failure count
    failures: u32,
}

impl Heartbeat {
    #[must_use]
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            interval,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Change the interval and reschedule from `now` (`None` disables).
    pub fn set_interval(&mut self, interval: Option<Duration>, now: Instant) {
        self.interval = interval;
        self.schedule(now);
    }

    /// Arm the next ping one interval from `now`.
    pub fn schedule(&mut self, now: Instant) {
        match self.interval {
            Some(interval) => self.timer.arm(now + interval),
            None => self.timer.cancel(),
        }
    }

    /// Stop probing until [`schedule`](Self::schedule) is called again.
    pub fn stop(&mut self) {
        self.timer.cancel();
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    /// True when a ping should be sent now.
    pub fn due(&mut self, now: Instant) -> bool {
        self.timer.fire(now)
    }

    /// Record a successful ping; resets the failure count.
    pub fn record_success(&mut self, now: Instant) {
        self.failures = 0;
        crate::metrics::record_heartbeat("ok");
        self.schedule(now);
    }

    /// Record a missed heartbeat. Returns the consecutive failure count.
    pub fn record_failure(&mut self) -> u32 {
        self.failures += 1;
        crate::metrics::record_heartbeat("missed");
        self.failures
    }

    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.failures
    }

    pub fn shut_down(&mut self) {
        self.timer.shut_down();
    }
}
