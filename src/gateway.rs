// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mirror gateway: the entry point business write paths call after a commit.
//!
//! The gateway never fails and never blocks the caller's outcome. By the time
//! it runs, the caller's write is already committed on the primary; a mirror
//! problem becomes a warning in the log and nothing else.
//!
//! # Example
//!
//! ```rust,no_run
//! use failover_mirror::{ChangePropagator, MirrorGateway, MutationOp};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example(propagator: Arc<ChangePropagator>) {
//! let gateway = MirrorGateway::new(propagator);
//!
//! // After the order is committed on the primary:
//! let order = json!({"_id": "o-1001", "status": "paid", "total": 42.5});
//! gateway.mirror_order(MutationOp::Insert, &order).await;
//! # }
//! ```

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::envelope::MutationOp;
use crate::propagator::{ChangePropagator, MirrorOutcome, PropagatorMode};

/// Business document kinds that are mirrored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    InventoryItem,
    Order,
}

impl DocumentKind {
    /// Collection the documents of this kind live in.
    #[must_use]
    pub fn collection(&self) -> &'static str {
        match self {
            Self::InventoryItem => "inventoryitems",
            Self::Order => "orders",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.collection())
    }
}

/// Façade over the propagator's on-demand path.
#[derive(Debug, Clone)]
pub struct MirrorGateway {
    propagator: Arc<ChangePropagator>,
}

impl MirrorGateway {
    pub fn new(propagator: Arc<ChangePropagator>) -> Self {
        Self { propagator }
    }

    /// Mirror one committed mutation.
    ///
    /// Starts the propagator in on-demand mode on first use if nothing
    /// started it. While the propagator is streaming the change feed already
    /// carries this commit, so the call is skipped.
    pub async fn mirror(&self, kind: DocumentKind, op: MutationOp, doc: &Value) -> MirrorOutcome {
        match self.propagator.mode() {
            PropagatorMode::Stopped => {
                debug!("Starting propagator on demand");
                self.propagator.start(false, None).await;
            }
            PropagatorMode::Streaming => {
                debug!(kind = %kind, op = %op, "Change feed is mirroring, on-demand call skipped");
                return MirrorOutcome::Skipped;
            }
            PropagatorMode::OnDemand => {}
        }

        self.propagator
            .mirror_document(kind.collection(), op, doc)
            .await
    }

    pub async fn mirror_inventory_item(&self, op: MutationOp, doc: &Value) -> MirrorOutcome {
        self.mirror(DocumentKind::InventoryItem, op, doc).await
    }

    pub async fn mirror_order(&self, op: MutationOp, doc: &Value) -> MirrorOutcome {
        self.mirror(DocumentKind::Order, op, doc).await
    }

    /// Whether a mirror distinct from the primary store is configured.
    #[must_use]
    pub fn is_mirror_configured(&self) -> bool {
        self.propagator.is_mirror_configured()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FailoverConfig;
    use crate::storage::memory::{InMemoryStore, MemoryConnector};
    use crate::supervisor::ConnectionSupervisor;
    use serde_json::json;

    async fn gateway(mirror_uri: &str) -> (MirrorGateway, Arc<InMemoryStore>, Arc<InMemoryStore>) {
        let connector = Arc::new(MemoryConnector::new());
        let primary = connector.register("mem://primary");
        let mirror = connector.register("mem://mirror");
        let config = FailoverConfig {
            mirror_uri: Some(mirror_uri.into()),
            enable_health_monitoring: false,
            connect_attempts: 1,
            ..FailoverConfig::new("mem://primary")
        };
        let supervisor = ConnectionSupervisor::initialize(config.clone(), connector)
            .await
            .unwrap();
        let propagator = Arc::new(ChangePropagator::new(supervisor, &config));
        (MirrorGateway::new(propagator), primary, mirror)
    }

    #[test]
    fn test_kind_collections() {
        assert_eq!(DocumentKind::InventoryItem.collection(), "inventoryitems");
        assert_eq!(DocumentKind::Order.to_string(), "orders");
    }

    #[tokio::test]
    async fn test_first_call_starts_on_demand() {
        let (gateway, _primary, mirror) = gateway("mem://mirror").await;

        let outcome = gateway
            .mirror_order(MutationOp::Insert, &json!({"_id": "o-1"}))
            .await;

        assert!(outcome.is_applied());
        assert_eq!(gateway.propagator.mode(), PropagatorMode::OnDemand);
        assert_eq!(mirror.collection_len("orders"), 1);
    }

    #[tokio::test]
    async fn test_mirror_configured_only_for_distinct_store() {
        let (distinct, _, _) = gateway("mem://mirror").await;
        assert!(distinct.is_mirror_configured());

        let (aliased, _, _) = gateway("mem://primary").await;
        assert!(!aliased.is_mirror_configured());
    }

    #[tokio::test]
    async fn test_failure_never_escapes() {
        let (gateway, _primary, mirror) = gateway("mem://mirror").await;
        mirror.simulate_disconnect();

        let outcome = gateway
            .mirror_inventory_item(MutationOp::Update, &json!({"_id": "sku-1", "qty": 3}))
            .await;
        assert!(matches!(outcome, MirrorOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_streaming_mode_skips_on_demand_calls() {
        let (gateway, _primary, mirror) = gateway("mem://mirror").await;
        gateway.propagator.start(true, None).await;

        let outcome = gateway
            .mirror_order(MutationOp::Insert, &json!({"_id": "o-1"}))
            .await;
        assert_eq!(outcome, MirrorOutcome::Skipped);
        assert_eq!(mirror.envelope_count(), 0);
        gateway.propagator.stop().await;
    }

    #[tokio::test]
    async fn test_calls_reach_mirror_after_feed_ends() {
        let (gateway, primary, mirror) = gateway("mem://mirror").await;
        gateway.propagator.start(true, None).await;
        assert_eq!(gateway.propagator.mode(), PropagatorMode::Streaming);

        primary.end_feeds();
        for _ in 0..200 {
            if gateway.propagator.mode() != PropagatorMode::Streaming {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let outcome = gateway
            .mirror_order(MutationOp::Insert, &json!({"_id": "o-2", "status": "paid"}))
            .await;
        assert!(outcome.is_applied());
        let env = mirror.envelope("orders", "o-2").unwrap();
        assert_eq!(env.fields["status"], "paid");
        gateway.propagator.stop().await;
    }
}
