// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public API of the sync client: activity, events, introspection.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::debug;

use super::types::{ProfilingData, TreeUpdate, VersionInfo};
use super::SyncClient;
use crate::binding::ElementHandle;
use crate::communication::LoadingState;
use crate::error::SyncError;
use crate::protocol::EventMessage;
use crate::resilience::ConnectionState;
use crate::session::PROPERTY_SYNC_EVENT;
use crate::tree::{features, NodeChange, NodeId, StateTree};

impl SyncClient {
    // ═══════════════════════════════════════════════════════════════════════════
    // API: Activity
    // ═══════════════════════════════════════════════════════════════════════════

    /// Whether the client still has work in progress: the initial message
    /// is not handled yet, a request is in flight, deferred work is queued,
    /// or something is waiting to be sent.
    ///
    /// Evaluated on every call, never cached.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.ctx.lock().is_active() || self.running_deferred.load(Ordering::SeqCst) > 0
    }

    /// Wait until [`is_active`](Self::is_active) turns false.
    pub async fn wait_until_idle(&self) {
        loop {
            let notified = self.phase_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_active() {
                return;
            }
            notified.await;
        }
    }

    /// Wait until no request is in flight. Weaker than
    /// [`wait_until_idle`](Self::wait_until_idle): queued work is ignored.
    pub async fn wait_for_quiescence(&self) {
        let mut idle = self.ctx.lock().tracker.subscribe_idle();
        crate::communication::wait_for_quiescence(&mut idle).await;
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // API: Tree and surface
    // ═══════════════════════════════════════════════════════════════════════════

    /// Read the client's copy of the tree.
    pub fn with_tree<T>(&self, f: impl FnOnce(&StateTree) -> T) -> T {
        f(self.ctx.lock().tree())
    }

    /// Surface element bound to `node`. Lock-free.
    #[must_use]
    pub fn element_for_node(&self, node: NodeId) -> Option<ElementHandle> {
        let elements = self.elements.as_ref()?;
        elements.get(&node).map(|e| *e)
    }

    /// Ask the session for news now instead of waiting for the poll timer.
    pub fn poll(&self) {
        self.ctx.lock().sender.request_poll();
        self.wake.notify_one();
    }

    /// Queue an event for `node`. Fails once the client has been shut down.
    pub fn send_event_message(
        &self,
        node: NodeId,
        event_type: impl Into<String>,
        event_data: Value,
    ) -> Result<(), SyncError> {
        let mut ctx = self.ctx.lock();
        if ctx.is_torn_down() {
            return Err(SyncError::ShutDown);
        }
        ctx.sender
            .queue_event(EventMessage::new(node, event_type, event_data));
        drop(ctx);
        self.wake.notify_one();
        Ok(())
    }

    /// Turn a raw surface event into an event message. Returns false when
    /// the element is unknown or its node does not listen for `event_type`.
    pub fn capture_event(&self, element: ElementHandle, event_type: &str, event_data: Value) -> bool {
        let mut guard = self.ctx.lock();
        let ctx = &mut *guard;
        if ctx.is_torn_down() {
            return false;
        }
        let Some(binder) = ctx.binder.as_ref() else {
            return false;
        };
        let Some(event) = binder.capture_event(&ctx.tree, element, event_type, event_data) else {
            return false;
        };
        ctx.sender.queue_event(event);
        drop(guard);
        self.wake.notify_one();
        true
    }

    /// A property changed on the surface side (e.g. user typed into an
    /// input): update the local tree right away and tell the session.
    pub fn set_property_from_surface(
        &self,
        node: NodeId,
        name: &str,
        value: Value,
    ) -> Result<(), SyncError> {
        let mut guard = self.ctx.lock();
        let ctx = &mut *guard;
        if ctx.is_torn_down() {
            return Err(SyncError::ShutDown);
        }
        ctx.tree.apply_change(&NodeChange::put_entry(
            node,
            features::PROPERTIES,
            name,
            value.clone(),
        ))?;
        if let Some(binder) = ctx.binder.as_mut() {
            binder.sync(&ctx.tree);
        }
        ctx.sender.queue_event(EventMessage::new(
            node,
            PROPERTY_SYNC_EVENT,
            json!({ "name": name, "value": value }),
        ));
        drop(guard);
        debug!(node = %node, name, "Queued property sync");
        self.wake.notify_one();
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // API: Observers and introspection
    // ═══════════════════════════════════════════════════════════════════════════

    /// Register a callback run (outside the context lock) after every
    /// applied message or snapshot. A panicking observer is reported to the
    /// error sink and does not affect the others.
    pub fn add_change_observer<F>(&self, observer: F)
    where
        F: Fn(TreeUpdate) + Send + Sync + 'static,
    {
        self.ctx.lock().observers.push(Arc::new(observer));
    }

    #[must_use]
    pub fn profiling_data(&self) -> ProfilingData {
        self.ctx.lock().profiling_data()
    }

    /// Loading indicator stage right now. Poll it from the render loop.
    #[must_use]
    pub fn loading_state(&self) -> LoadingState {
        self.ctx.lock().loading_state(tokio::time::Instant::now())
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.ctx.lock().connection.state()
    }

    /// Watch connection state changes (e.g. to show a "reconnecting" banner).
    #[must_use]
    pub fn connection_state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.ctx.lock().connection.subscribe()
    }

    #[must_use]
    pub fn version_info(&self) -> VersionInfo {
        VersionInfo::default()
    }

    /// Human-readable dump of the client tree.
    #[must_use]
    pub fn debug_dump(&self) -> String {
        self.ctx.lock().tree().debug_dump()
    }
}
