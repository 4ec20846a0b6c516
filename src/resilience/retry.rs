// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reconnect backoff policy.
//!
//! Different presets are available for different use cases.
//!
//! # Example
//!
//! ```
//! use tree_sync::ReconnectPolicy;
//! use std::time::Duration;
//!
//! // Interactive: give up quickly so the user sees an error state
//! let interactive = ReconnectPolicy::interactive();
//! assert_eq!(interactive.max_attempts, Some(5));
//!
//! // Patient: never give up on reconnection
//! let patient = ReconnectPolicy::patient();
//! assert_eq!(patient.max_attempts, None);
//!
//! assert_eq!(interactive.delay_for_attempt(0), interactive.initial_delay);
//! ```

use std::time::Duration;

/// Backoff parameters for the connection state machine.
///
/// Use the preset constructors for common patterns:
/// - [`ReconnectPolicy::interactive()`] - bounded retries, user-facing UI
/// - [`ReconnectPolicy::patient()`] - infinite retry for kiosk-style clients
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Failed attempts before giving up (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Time offline before giving up (None = unlimited)
    pub max_elapsed: Option<Duration>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::interactive()
    }
}

impl ReconnectPolicy {
    /// Bounded retry for user-facing clients.
    /// 5 attempts with exponential backoff, giving up after roughly 15 seconds.
    #[must_use]
    pub fn interactive() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            factor: 2.0,
            max_attempts: Some(5),
            max_elapsed: None,
        }
    }

    /// Infinite retry (never give up!).
    /// Backoff capped at 5 minutes.
    #[must_use]
    pub fn patient() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300), // Cap at 5 minutes
            factor: 2.0,
            max_attempts: None,
            max_elapsed: None,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
            max_attempts: Some(3),
            max_elapsed: None,
        }
    }

    /// Delay before attempt `attempt` (0-based): `initial * factor^attempt`,
    /// capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 0..attempt {
            delay = delay.mul_f64(self.factor).min(self.max_delay);
            if delay == self.max_delay {
                break;
            }
        }
        delay.min(self.max_delay)
    }

    /// Whether another attempt is allowed after `failed` failures and
    /// `elapsed` time offline.
    #[must_use]
    pub fn allows_attempt(&self, failed: u32, elapsed: Duration) -> bool {
        if let Some(max) = self.max_attempts {
            if failed >= max {
                return false;
            }
        }
        if let Some(max) = self.max_elapsed {
            if elapsed >= max {
                return false;
            }
        }
        true
    }
}
