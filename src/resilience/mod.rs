// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connection supervision: reconnect backoff, heartbeat and polling.

pub mod connection;
pub mod heartbeat;
pub mod poller;
pub mod retry;

pub use connection::{ConnectionState, ConnectionStateMachine, ResumeMode};
pub use heartbeat::Heartbeat;
pub use poller::Poller;
pub use retry::ReconnectPolicy;
