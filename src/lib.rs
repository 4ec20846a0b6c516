// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Tree Sync
//!
//! A server-authoritative UI state tree, kept in sync with a client copy
//! through ordered, numbered change messages.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    UiSession (server side)                  │
//! │  • Authoritative StateTree with change tracking             │
//! │  • EventRouter dispatches client events to handlers         │
//! │  • Numbers outgoing diffs, keeps history for resends        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!              (JSON envelopes over a Transport)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    SyncClient (client side)                 │
//! │  • MessageHandler: in-order apply, gap buffer, snapshots    │
//! │  • RequestResponseTracker: one request in flight            │
//! │  • Connection state machine, heartbeat, poller              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                    (Binder reconciles)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        RenderSurface                        │
//! │  • One element per attached node                            │
//! │  • Raw events captured back into event messages             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use parking_lot::Mutex;
//! use serde_json::json;
//! use tokio::sync::watch;
//! use tree_sync::{
//!     EventRouter, LoopbackTransport, NodeChange, NodeId, SyncClient, SyncConfig, UiSession,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SyncConfig::default();
//!     let router = EventRouter::builder()
//!         .on("click", |tree, event| {
//!             tree.apply_change(&NodeChange::put(event.node_id, "text", json!("clicked")))?;
//!             Ok(())
//!         })
//!         .build();
//!     let mut session = UiSession::new(&config, router);
//!     let (button, _) = session.update(|tree| tree.allocate_node(NodeId::ROOT));
//!     let button = button.expect("Failed to allocate");
//!     let session = Arc::new(Mutex::new(session));
//!     let transport = Arc::new(LoopbackTransport::new(session));
//!
//!     let (_tx, rx) = watch::channel(config.clone());
//!     let client = Arc::new(SyncClient::new(config, rx, transport));
//!     client.start(None).expect("Failed to start");
//!
//!     let runner = Arc::clone(&client);
//!     tokio::spawn(async move { runner.run().await });
//!     client.wait_until_idle().await;
//!
//!     client.send_event_message(button, "click", json!({})).expect("Failed to send");
//!     client.wait_until_idle().await;
//!     println!("{}", client.debug_dump());
//!
//!     client.shutdown();
//! }
//! ```
//!
//! ## Features
//!
//! - **Ordered diffs**: Messages apply strictly in sequence; early ones wait in a bounded buffer
//! - **Gap recovery**: Resend requests first, full snapshot once the retry budget runs out
//! - **Single flight**: At most one request outstanding; resync may override it
//! - **Reconnect**: Exponential backoff, full resync after long downtime
//! - **Isolation**: Listener and observer failures go to an error sink, never the sync loop
//!
//! ## Configuration
//!
//! See [`SyncConfig`] for all configuration options.
//!
//! ## Modules
//!
//! - [`tree`]: Arena-backed state tree and change records
//! - [`protocol`]: Wire messages and the JSON codec
//! - [`session`]: Server-side session and event routing
//! - [`communication`]: Message handler, request tracker, request assembly
//! - [`resilience`]: Connection state machine, heartbeat, poller, backoff
//! - [`transport`]: Transport trait and the in-process loopback
//! - [`binding`]: Render surface trait and the tree binder
//! - [`client`]: The [`SyncClient`] tying it all together

pub mod config;
pub mod error;
pub mod tree;
pub mod protocol;
pub mod scheduler;
pub mod resilience;
pub mod transport;
pub mod session;
pub mod communication;
pub mod binding;
pub mod client;
pub mod metrics;

pub use config::SyncConfig;
pub use error::{ErrorHandler, ErrorKind, ErrorSink, LoggingErrorHandler, SyncError};
pub use tree::{features, NodeChange, NodeId, StateNode, StateTree, TreeError};
pub use protocol::{ChangeMessage, CodecError, EventMessage, RequestKind, SyncRequest, SyncResponse};
pub use session::{EventRouter, UiSession, PROPERTY_SYNC_EVENT};
pub use communication::{
    GapFillOutcome, HandleOutcome, LoadingState, MessageHandler, RequestResponseTracker,
    ResyncReason,
};
pub use resilience::{ConnectionState, ReconnectPolicy};
pub use transport::{LoopbackTransport, Transport, TransportError};
pub use binding::{Binder, ElementHandle, MemorySurface, RenderSurface};
pub use client::{ProfilingData, SyncClient, TreeUpdate, VersionInfo};
pub use metrics::LatencyTimer;
