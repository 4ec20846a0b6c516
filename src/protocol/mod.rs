// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Message protocol: envelopes and their JSON codec.

pub mod codec;
pub mod message;

pub use codec::CodecError;
pub use message::{ChangeMessage, EventMessage, RequestKind, SyncRequest, SyncResponse};
