// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for tree-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding application is responsible for choosing the exporter.
//!
//! # Metric Naming Convention
//! - `tree_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//! - `_bytes` suffix for size histograms
//!
//! # Labels
//! - `outcome`: applied, buffered, duplicate, snapshot, ...
//! - `kind`: normal, resend, resynchronize, poll
//! - `category`: error taxonomy (`transport`, `protocol_ordering`, ...)

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record what the handler did with an inbound change message
pub fn record_message(outcome: &str) {
    counter!(
        "tree_sync_messages_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record the number of changes applied from one message
pub fn record_changes_applied(count: usize) {
    counter!("tree_sync_changes_applied_total").increment(count as u64);
}

/// Record time spent applying one message to the tree
pub fn record_processing_time(duration: Duration) {
    histogram!("tree_sync_processing_seconds").record(duration.as_secs_f64());
}

/// Set number of out-of-order messages waiting in the buffer
pub fn set_buffered_messages(count: usize) {
    gauge!("tree_sync_buffered_messages").set(count as f64);
}

/// Set number of nodes held by the tree (detached ones included)
pub fn set_tree_nodes(count: usize) {
    gauge!("tree_sync_tree_nodes").set(count as f64);
}

/// Record a full resynchronization request and why it happened
pub fn record_resync(reason: &str) {
    counter!(
        "tree_sync_resyncs_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record an outbound request
pub fn record_request(kind: &str) {
    counter!(
        "tree_sync_requests_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record round-trip latency of a request
pub fn record_request_latency(duration: Duration) {
    histogram!("tree_sync_request_seconds").record(duration.as_secs_f64());
}

/// Record encoded/decoded payload size
pub fn record_payload_bytes(what: &str, direction: &str, bytes: usize) {
    histogram!(
        "tree_sync_payload_bytes",
        "what" => what.to_string(),
        "direction" => direction.to_string()
    )
    .record(bytes as f64);
}

/// Set connection state (0 = connected, 1 = lost, 2 = reconnecting, 3 = failed)
pub fn set_connection_state(state: u8) {
    gauge!("tree_sync_connection_state").set(state as f64);
}

/// Record a reconnect attempt outcome (started, succeeded, failed, gave_up)
pub fn record_reconnect(outcome: &str) {
    counter!(
        "tree_sync_reconnects_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a heartbeat ping outcome
pub fn record_heartbeat(outcome: &str) {
    counter!(
        "tree_sync_heartbeats_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record an event message dispatched by the session
pub fn record_event_dispatched(event_type: &str) {
    counter!(
        "tree_sync_events_dispatched_total",
        "event_type" => event_type.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// ERROR TRACKING - Categorized error counters for alerting
// ═══════════════════════════════════════════════════════════════════════════

/// Record an error with category for alerting
pub fn record_error(category: &str, context: &str) {
    counter!(
        "tree_sync_errors_total",
        "category" => category.to_string(),
        "context" => context.to_string()
    )
    .increment(1);
}

/// Helper struct for timing operations; records on drop
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    /// Start a new processing timer
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for LatencyTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_processing_time(self.start.elapsed());
    }
}
