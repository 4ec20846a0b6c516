// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Message transport abstraction.
//!
//! The client core only sees [`Transport`]; the byte-level wire (HTTP,
//! WebSocket, ...) lives behind it. [`LoopbackTransport`] connects directly to
//! an in-process [`UiSession`](crate::session::UiSession).

pub mod memory;
pub mod traits;

pub use memory::LoopbackTransport;
pub use traits::{Transport, TransportError};
