// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the sync client.

use std::time::Duration;

use crate::communication::ProcessingStats;

/// Wire protocol revision spoken by this crate.
pub const PROTOCOL_VERSION: u32 = 1;

/// Passed to change observers after a message (or snapshot) is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeUpdate {
    pub last_sequence_id: u64,
    /// True when local state was replaced by a snapshot.
    pub resynchronized: bool,
}

/// Timing and volume counters for the embedding application.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfilingData {
    pub processing: ProcessingStats,
    pub requests_sent: u64,
    pub resyncs: u64,
    pub buffered_messages: usize,
    pub tree_nodes: usize,
}

impl ProfilingData {
    /// Mean time spent applying one message.
    #[must_use]
    pub fn mean_processing(&self) -> Option<Duration> {
        let count = u32::try_from(self.processing.messages_applied).ok()?;
        (count > 0).then(|| self.processing.total_processing / count)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub crate_version: &'static str,
    pub protocol_version: u32,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            crate_version: env!("CARGO_PKG_VERSION"),
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

impl std::fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tree-sync {} (protocol v{})", self.crate_version, self.protocol_version)
    }
}
