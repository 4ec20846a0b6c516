// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Projection of the state tree onto a rendering surface.

pub mod binder;
pub mod surface;

pub use binder::Binder;
pub use surface::{ElementHandle, MemorySurface, RenderSurface};
