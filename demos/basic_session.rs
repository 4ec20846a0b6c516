// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic tree-sync usage example.
//!
//! Demonstrates:
//! 1. Building a session with an event handler
//! 2. Bootstrapping a client (with an in-memory render surface)
//! 3. Sending clicks and watching the tree and surface follow
//! 4. Server-initiated pushes
//! 5. Riding out a connection loss
//! 6. Displaying metrics
//! 7. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_session
//! ```

use std::sync::Arc;
use std::time::Duration;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::watch;
use tree_sync::{
    features, EventRouter, LoopbackTransport, MemorySurface, NodeChange, NodeId, SyncClient,
    SyncConfig, UiSession,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           tree-sync: Basic Session Example                    ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Session with a click counter
    // ─────────────────────────────────────────────────────────────────────────
    println!("📋 Building session...");
    let config = SyncConfig {
        heartbeat_interval_ms: 1_000,
        reconnect_initial_delay_ms: 50,
        ..Default::default()
    };
    let router = EventRouter::builder()
        .on("click", |tree, event| {
            let clicks = tree
                .node(event.node_id)
                .and_then(|n| n.scalar("clicks"))
                .and_then(Value::as_u64)
                .unwrap_or(0)
                + 1;
            tree.apply_change(&NodeChange::put(event.node_id, "clicks", json!(clicks)))?;
            tree.apply_change(&NodeChange::put(
                event.node_id,
                features::TEXT,
                json!(format!("Clicked {} times", clicks)),
            ))?;
            Ok(())
        })
        .build();
    let mut session = UiSession::new(&config, router);
    let button = session.tree_mut().allocate_node(NodeId::ROOT)?;
    for change in [
        NodeChange::put(button, features::TAG, json!("button")),
        NodeChange::put(button, features::TEXT, json!("Click me")),
        NodeChange::put_entry(button, features::LISTENERS, "click", json!({})),
    ] {
        session.tree_mut().apply_change(&change)?;
    }
    let session = Arc::new(Mutex::new(session));
    let transport = Arc::new(LoopbackTransport::new(session.clone()));

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Client bootstrap
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔌 Starting client...");
    let surface = MemorySurface::new();
    let (_config_tx, config_rx) = watch::channel(config.clone());
    let client = Arc::new(
        SyncClient::new(config, config_rx, transport.clone())
            .with_surface(Box::new(surface.clone())),
    );
    client.add_change_observer(|update| {
        println!("   👀 tree now at message {}{}", update.last_sequence_id,
            if update.resynchronized { " (snapshot)" } else { "" });
    });
    client.start(None)?;
    let runner = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };
    client.wait_until_idle().await;
    println!("   ✅ {} | surface: {}", client.version_info(), surface.render());

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Clicks
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🖱️  Clicking three times...");
    let element = client
        .element_for_node(button)
        .ok_or("button was not rendered")?;
    for _ in 0..3 {
        client.capture_event(element, "click", json!({}));
        client.wait_until_idle().await;
    }
    println!("   ✅ surface: {}", surface.render());

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Push
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📣 Session pushes a status line...");
    {
        let mut session = session.lock();
        let tree = session.tree_mut();
        let status = tree.allocate_node(NodeId::ROOT)?;
        tree.apply_change(&NodeChange::put(status, features::TAG, json!("p")))?;
        tree.apply_change(&NodeChange::put(status, features::TEXT, json!("Hello from the session")))?;
    }
    transport.push_pending();
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.wait_until_idle().await;
    println!("   ✅ surface: {}", surface.render());

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Connection loss
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📴 Dropping the connection for 300ms...");
    let mut states = client.connection_state_receiver();
    transport.set_offline(true);
    client.send_event_message(button, "click", json!({}))?;
    states.changed().await?;
    println!("   ⚠️  connection: {}", client.connection_state());
    tokio::time::sleep(Duration::from_millis(300)).await;
    transport.set_offline(false);
    client.wait_until_idle().await;
    println!("   ✅ connection: {} | surface: {}", client.connection_state(), surface.render());

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    let profile = client.profiling_data();
    println!("\n📊 Profiling: {} requests, {} messages applied, mean {:?}",
        profile.requests_sent,
        profile.processing.messages_applied,
        profile.mean_processing());
    println!("\n📊 Metrics snapshot:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 7. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    client.shutdown();
    runner.await??;
    println!("   ✅ Shutdown complete!\n");
    println!("{}", client.debug_dump());

    Ok(())
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let snapshot = snapshotter.snapshot();

    let mut lines: Vec<String> = Vec::new();
    for (composite_key, _, _, value) in snapshot.into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };

        let rendered = match value {
            DebugValue::Counter(v) => format!("{} = {}", label_str, v),
            DebugValue::Gauge(v) => format!("{} = {:.2}", label_str, v.into_inner()),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                format!("{} count={} sum={:.4}", label_str, count, sum)
            }
        };
        lines.push(format!("{}{}", key.name(), rendered));
    }
    lines.sort();

    if lines.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
    for line in &lines {
        println!("   │  └─ {}", line);
    }
}
