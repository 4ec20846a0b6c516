// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync client.
//!
//! The [`SyncClient`] owns one [`SyncContext`] and drives it from a single
//! cooperative loop ([`SyncClient::run`]):
//!
//! ```text
//!   push channel ─┐
//!   responses ────┼──▶ SyncContext (locked for one step) ──▶ deferred work
//!   timers ───────┤         │                                 (lock released)
//!   config / API ─┘         ▼                                        │
//!                     next outbound request ──▶ Transport            ▼
//!                                                           phase-done notify
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use parking_lot::Mutex;
//! use tokio::sync::watch;
//! use tree_sync::{EventRouter, LoopbackTransport, SyncClient, SyncConfig, UiSession};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = SyncConfig::default();
//! let session = Arc::new(Mutex::new(UiSession::new(&config, EventRouter::default())));
//! let transport = Arc::new(LoopbackTransport::new(session));
//!
//! let (_tx, rx) = watch::channel(config.clone());
//! let client = Arc::new(SyncClient::new(config, rx, transport));
//! client.start(None).expect("start");
//!
//! let runner = Arc::clone(&client);
//! tokio::spawn(async move { runner.run().await });
//! client.wait_until_idle().await;
//! # }
//! ```

mod api;
mod context;
mod lifecycle;
mod types;

pub use context::{ChangeObserver, Effects, Outbound, SyncContext};
pub use types::{ProfilingData, TreeUpdate, VersionInfo, PROTOCOL_VERSION};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};

use crate::binding::{Binder, ElementHandle, RenderSurface};
use crate::config::SyncConfig;
use crate::error::ErrorSink;
use crate::transport::Transport;
use crate::tree::NodeId;

/// Client half of the synchronization protocol.
///
/// # Thread Safety
///
/// `SyncClient` is `Send + Sync`; share it behind an `Arc`. The context lock
/// is a synchronous mutex held for one state transition at a time, so API
/// calls never wait on network I/O.
pub struct SyncClient {
    /// Every protocol component, behind one lock
    pub(super) ctx: Arc<Mutex<SyncContext>>,

    pub(super) transport: Arc<dyn Transport>,

    /// Runtime config updates (async mutex so run() can take &self)
    pub(super) config_rx: tokio::sync::Mutex<watch::Receiver<SyncConfig>>,

    /// Node → element lookups without taking the context lock
    pub(super) elements: Option<Arc<DashMap<NodeId, ElementHandle>>>,

    /// Nudges the run loop after an API call changed the context
    pub(super) wake: Arc<Notify>,

    /// Signalled after every processing phase
    pub(super) phase_done: Arc<Notify>,

    pub(super) shutdown_tx: watch::Sender<bool>,

    pub(super) sink: ErrorSink,

    /// Deferred batches currently running outside the lock
    pub(super) running_deferred: AtomicUsize,
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("ctx", &*self.ctx.lock())
            .finish_non_exhaustive()
    }
}

impl SyncClient {
    /// Create a client. Nothing happens until [`start`](Self::start) and
    /// [`run`](Self::run).
    pub fn new(
        config: SyncConfig,
        config_rx: watch::Receiver<SyncConfig>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let sink = ErrorSink::default();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            ctx: Arc::new(Mutex::new(SyncContext::new(config, sink.clone()))),
            transport,
            config_rx: tokio::sync::Mutex::new(config_rx),
            elements: None,
            wake: Arc::new(Notify::new()),
            phase_done: Arc::new(Notify::new()),
            shutdown_tx,
            sink,
            running_deferred: AtomicUsize::new(0),
        }
    }

    /// Render the tree onto `surface`.
    #[must_use]
    pub fn with_surface(mut self, surface: Box<dyn RenderSurface>) -> Self {
        let mut binder = Binder::new(surface);
        self.elements = Some(binder.element_map());
        let mut ctx = self.ctx.lock();
        binder.rebuild(ctx.tree());
        ctx.binder = Some(binder);
        drop(ctx);
        self
    }

    /// Route unhandled errors (listener panics, protocol errors) to `sink`.
    #[must_use]
    pub fn with_error_sink(mut self, sink: ErrorSink) -> Self {
        self.ctx.lock().sink = sink.clone();
        self.sink = sink;
        self
    }

    /// Run queued deferred work outside the lock, then tell waiters a phase
    /// has ended.
    pub(super) fn finish_phase(&self) {
        self.running_deferred.fetch_add(1, Ordering::SeqCst);
        let batch = self.ctx.lock().take_deferred();
        if !batch.is_empty() {
            batch.run(&self.sink);
        }
        self.running_deferred.fetch_sub(1, Ordering::SeqCst);
        self.phase_done.notify_waiters();
    }
}
