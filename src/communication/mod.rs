// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Request/response plumbing of the client core.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                    Communication Module                    │
//! ├────────────────────────────────────────────────────────────┤
//! │  tracker.rs  - single-flight request discipline            │
//! │  sender.rs   - assembles the next outbound request         │
//! │  handler.rs  - ordered application of change messages      │
//! │  loading.rs  - loading indicator stages                    │
//! └────────────────────────────────────────────────────────────┘
//! ```

pub mod handler;
pub mod loading;
pub mod sender;
pub mod tracker;

pub use handler::{
    GapFillOutcome, HandleOutcome, HandlerState, MessageHandler, ProcessingStats, ResyncReason,
};
pub use loading::{LoadingDelays, LoadingIndicator, LoadingState};
pub use sender::MessageSender;
pub use tracker::{wait_for_quiescence, PendingRequest, RequestId, RequestResponseTracker};
