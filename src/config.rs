// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the sync client and session.
//!
//! # Example
//!
//! ```
//! use tree_sync::SyncConfig;
//!
//! // Minimal config (uses defaults)
//! let config = SyncConfig::default();
//! assert_eq!(config.max_buffered_messages, 32);
//! assert_eq!(config.max_gap_retries, 3);
//!
//! // Poll every second, give up reconnecting after five attempts
//! let config = SyncConfig {
//!     poll_interval_ms: 1_000,
//!     reconnect_max_attempts: Some(5),
//!     ..Default::default()
//! };
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::resilience::retry::ReconnectPolicy;

/// Configuration for the sync core.
///
/// All fields have sensible defaults. Intervals of `0` disable the feature.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Sequence id of the first change message the session sends
    #[serde(default = "default_initial_sequence_id")]
    pub initial_sequence_id: u64,

    /// Out-of-order messages held while waiting for a gap to fill
    #[serde(default = "default_max_buffered_messages")]
    pub max_buffered_messages: usize,

    /// Gap-fill requests before giving up and asking for a snapshot
    #[serde(default = "default_max_gap_retries")]
    pub max_gap_retries: u32,

    /// A request without response after this long is considered lost
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Poll interval while connected (0 = no polling unless the session sets one)
    #[serde(default)]
    pub poll_interval_ms: u64,

    /// Heartbeat interval (0 = disabled)
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Downtime after which a reconnect starts from a full snapshot
    #[serde(default = "default_resync_after_ms")]
    pub resync_after_ms: u64,

    /// Reconnect backoff
    #[serde(default = "default_reconnect_initial_delay_ms")]
    pub reconnect_initial_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default = "default_reconnect_factor")]
    pub reconnect_factor: f64,
    /// Give up after this many failed attempts (None = no attempt limit)
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: Option<u32>,
    /// Give up after this long offline (None = no time limit)
    #[serde(default)]
    pub reconnect_max_elapsed_ms: Option<u64>,

    /// Change messages the session keeps for gap-fill resends
    #[serde(default = "default_session_history")]
    pub session_history: usize,

    /// Loading indicator stages, measured from the start of a request
    #[serde(default = "default_loading_first_delay_ms")]
    pub loading_first_delay_ms: u64,
    #[serde(default = "default_loading_second_delay_ms")]
    pub loading_second_delay_ms: u64,
    #[serde(default = "default_loading_third_delay_ms")]
    pub loading_third_delay_ms: u64,
}

fn default_initial_sequence_id() -> u64 { 1 }
fn default_max_buffered_messages() -> usize { 32 }
fn default_max_gap_retries() -> u32 { 3 }
fn default_request_timeout_ms() -> u64 { 30_000 }
fn default_heartbeat_interval_ms() -> u64 { 300_000 } // 5 minutes
fn default_resync_after_ms() -> u64 { 60_000 }
fn default_reconnect_initial_delay_ms() -> u64 { 500 }
fn default_reconnect_max_delay_ms() -> u64 { 30_000 }
fn default_reconnect_factor() -> f64 { 2.0 }
fn default_reconnect_max_attempts() -> Option<u32> { Some(10) }
fn default_session_history() -> usize { 64 }
fn default_loading_first_delay_ms() -> u64 { 300 }
fn default_loading_second_delay_ms() -> u64 { 1_500 }
fn default_loading_third_delay_ms() -> u64 { 5_000 }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            initial_sequence_id: default_initial_sequence_id(),
            max_buffered_messages: default_max_buffered_messages(),
            max_gap_retries: default_max_gap_retries(),
            request_timeout_ms: default_request_timeout_ms(),
            poll_interval_ms: 0,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            resync_after_ms: default_resync_after_ms(),
            reconnect_initial_delay_ms: default_reconnect_initial_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            reconnect_factor: default_reconnect_factor(),
            reconnect_max_attempts: default_reconnect_max_attempts(),
            reconnect_max_elapsed_ms: None,
            session_history: default_session_history(),
            loading_first_delay_ms: default_loading_first_delay_ms(),
            loading_second_delay_ms: default_loading_second_delay_ms(),
            loading_third_delay_ms: default_loading_third_delay_ms(),
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Option<Duration> {
        non_zero_ms(self.poll_interval_ms)
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        non_zero_ms(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub fn resync_after(&self) -> Duration {
        Duration::from_millis(self.resync_after_ms)
    }

    /// Backoff policy assembled from the `reconnect_*` fields.
    #[must_use]
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(self.reconnect_initial_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            factor: self.reconnect_factor,
            max_attempts: self.reconnect_max_attempts,
            max_elapsed: self.reconnect_max_elapsed_ms.map(Duration::from_millis),
        }
    }
}

fn non_zero_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
