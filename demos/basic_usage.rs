// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic failover-mirror usage example.
//!
//! Demonstrates:
//! 1. Bootstrapping a supervisor over a primary and a mirror store
//! 2. Mirroring inventory and order writes through the gateway
//! 3. Automatic failover when the primary drops, and the operator-released failback
//! 4. Manual override and its refusal rules
//! 5. Displaying metrics
//! 6. Clean shutdown
//!
//! Runs entirely in-process on the in-memory backend, no services needed.
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//!
//! # With debug logs
//! RUST_LOG=failover_mirror=debug cargo run --example basic_usage
//! ```

use failover_mirror::storage::memory::MemoryConnector;
use failover_mirror::{
    ChangePropagator, ConnectionSupervisor, DocumentStore, FailoverConfig, MirrorGateway,
    MutationOp, StoreRole, SupervisorEvent,
};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           failover-mirror: Basic Usage Example                ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Bootstrap
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Registering in-memory primary and mirror...");
    let connector = Arc::new(MemoryConnector::new());
    let primary = connector.register("mem://primary");
    let mirror = connector.register("mem://mirror");

    let config = FailoverConfig {
        mirror_uri: Some("mem://mirror".into()),
        health_check_interval_ms: 500,
        ..FailoverConfig::new("mem://primary")
    };

    let supervisor = ConnectionSupervisor::initialize(config.clone(), connector).await?;
    let mut events = supervisor.subscribe();
    println!("   ✅ Supervisor ready: {:?}", supervisor.get_database_status());

    let propagator = Arc::new(ChangePropagator::new(supervisor.clone(), &config));
    let gateway = MirrorGateway::new(propagator.clone());
    println!("   └─ Mirror configured: {}", gateway.is_mirror_configured());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Mirror business writes
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Mirroring committed writes...");
    let item = json!({"_id": "sku-100", "name": "Hex bolt M8", "qty": 250});
    let order = json!({"_id": "o-1001", "status": "paid", "total": 42.5});

    let outcome = gateway.mirror_inventory_item(MutationOp::Insert, &item).await;
    println!("   └─ inventoryitems/sku-100 insert → {:?}", outcome);
    let outcome = gateway.mirror_order(MutationOp::Insert, &order).await;
    println!("   └─ orders/o-1001 insert → {:?}", outcome);
    let outcome = gateway.mirror_inventory_item(MutationOp::Delete, &item).await;
    println!("   └─ inventoryitems/sku-100 delete → {:?}", outcome);

    if let Some(env) = mirror.find_envelope("inventoryitems", "sku-100").await? {
        println!("   └─ Mirror keeps the soft-deleted record: {}", env.to_document());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Failover and failback
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n💥 Dropping the primary connection...");
    primary.simulate_disconnect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("   └─ Active: {}", supervisor.get_active_connection().role());

    println!("\n🔌 Restoring the primary...");
    primary.simulate_reconnect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!(
        "   └─ Active: {} (failover stays in effect until released)",
        supervisor.get_active_connection().role()
    );

    supervisor.clear_manual_override();
    println!("   └─ Released, active: {}", supervisor.get_active_connection().role());

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Manual override
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🎛️  Pinning the mirror...");
    let result = supervisor.switch_database(StoreRole::Mirror);
    println!("   └─ {:?}", result);

    println!("   Waiting for one health poll (pin holds)...");
    tokio::time::sleep(Duration::from_millis(600)).await;
    println!("   └─ Active: {}", supervisor.get_active_connection().role());

    supervisor.clear_manual_override();
    println!("   └─ Override cleared, active: {}", supervisor.get_active_connection().role());

    let result = supervisor.switch_database_by_name("tertiary");
    println!("   └─ Unknown target refused: {:?}", result);

    println!("\n📣 Events observed:");
    while let Ok(event) = events.try_recv() {
        match event {
            SupervisorEvent::HealthCheck { .. } => println!("   └─ health-check"),
            other => println!("   └─ {}", serde_json::to_string(&other)?),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    propagator.stop().await;
    supervisor.close().await;
    println!("   ✅ Shutdown complete! {:?}", supervisor.get_database_status());

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Print captured counters, gauges and histograms sorted by name.
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines = Vec::new();

    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key
            .labels()
            .map(|l| format!("{}={}", l.key(), l.value()))
            .collect();
        let label_str = if labels.is_empty() {
            String::new()
        } else {
            format!("{{{}}}", labels.join(","))
        };

        let rendered = match value {
            DebugValue::Counter(v) => format!("counter {}", v),
            DebugValue::Gauge(v) => format!("gauge {:.2}", v.into_inner()),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                format!("histogram count={} sum={:.4}", count, sum)
            }
        };
        lines.push(format!("{}{} = {}", key.name(), label_str, rendered));
    }

    lines.sort();
    if lines.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
    for line in &lines {
        println!("   └─ {}", line);
    }
}
