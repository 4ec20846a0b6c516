// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Timers and deferred work for the cooperative sync loop.
//!
//! Nothing here sleeps or spawns: a [`CancellableTimer`] only stores a
//! deadline that the run loop waits on, and [`DeferredScheduler`] only queues
//! closures that the loop drains after each message-handling phase.

use std::collections::VecDeque;

use tokio::time::Instant;
use tracing::debug;

use crate::error::ErrorSink;

/// A one-shot deadline that can be re-armed and cancelled.
///
/// Cancelling is idempotent, and once [`shut_down`](Self::shut_down) a timer
/// never reports due again, so a late wake-up cannot reach a torn-down state
/// machine.
#[derive(Debug, Default)]
pub struct CancellableTimer {
    deadline: Option<Instant>,
    torn_down: bool,
}

impl CancellableTimer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) the timer. Ignored after shutdown.
    pub fn arm(&mut self, at: Instant) {
        if !self.torn_down {
            self.deadline = Some(at);
        }
    }

    /// Disarm the timer; a no-op when it is not armed.
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Permanently disarm the timer.
    pub fn shut_down(&mut self) {
        self.deadline = None;
        self.torn_down = true;
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Consume the deadline if it has passed. Returns true at most once per arm.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(at) if at <= now && !self.torn_down => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

type DeferredTask = Box<dyn FnOnce() + Send>;

/// Queue of work scheduled to run after the current synchronous phase.
///
/// Feeds the "is active" predicate through [`has_work_queued`](Self::has_work_queued).
#[derive(Default)]
pub struct DeferredScheduler {
    queue: VecDeque<DeferredTask>,
}

impl std::fmt::Debug for DeferredScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredScheduler")
            .field("queued", &self.queue.len())
            .finish()
    }
}

impl DeferredScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, task: impl FnOnce() + Send + 'static) {
        self.queue.push_back(Box::new(task));
    }

    #[must_use]
    pub fn has_work_queued(&self) -> bool {
        !self.queue.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Take everything currently queued. Tasks scheduled while the returned
    /// batch runs wait for the next drain.
    #[must_use]
    pub fn take_batch(&mut self) -> DeferredBatch {
        DeferredBatch {
            tasks: std::mem::take(&mut self.queue),
        }
    }

    /// Drop queued work without running it.
    pub fn clear(&mut self) {
        if !self.queue.is_empty() {
            debug!(dropped = self.queue.len(), "Dropping deferred work");
        }
        self.queue.clear();
    }
}

/// A drained set of deferred tasks, run outside any lock.
pub struct DeferredBatch {
    tasks: VecDeque<DeferredTask>,
}

impl DeferredBatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run every task; a panicking task is reported and the rest still run.
    pub fn run(self, sink: &ErrorSink) -> usize {
        let mut ran = 0;
        for task in self.tasks {
            if sink
                .guard("deferred", || {
                    task();
                    Ok::<_, std::convert::Infallible>(())
                })
                .is_some()
            {
                ran += 1;
            }
        }
        ran
    }
}
