// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Streaming mode: one worker draining the primary's change feed in order.
//!
//! The worker applies event N completely (success or logged failure) before
//! it reads event N+1. Upserts and soft deletes do not commute, so any
//! concurrency here could let a late update resurrect a deleted document.

use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ChangePropagator, MirrorOutcome, PropagatorMode};
use crate::cdc::{ChangeEvent, ChangeFeed};
use crate::envelope::{now_millis, MirrorEnvelope};

impl ChangePropagator {
    pub(super) fn spawn_feed_worker(
        self: &Arc<Self>,
        mut feed: ChangeFeed,
        mut shutdown: watch::Receiver<bool>,
        session_id: Uuid,
    ) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut applied: u64 = 0;
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    next = feed.next() => match next {
                        Some(event) => {
                            let Some(propagator) = weak.upgrade() else { break };
                            if propagator.apply_change(event).await.is_applied() {
                                applied += 1;
                            }
                        }
                        None => {
                            warn!(%session_id, "Change feed closed by the primary store, falling back to on-demand mirroring");
                            if let Some(propagator) = weak.upgrade() {
                                propagator.leave_streaming(session_id);
                            }
                            break;
                        }
                    },
                }
            }
            feed.close();
            info!(%session_id, applied, "Feed worker stopped");
        })
    }

    /// Switch a streaming session whose feed ended to on-demand delivery.
    ///
    /// The target and ownership stay as started, so `stop` still releases them.
    fn leave_streaming(&self, session_id: Uuid) {
        let mut state = self.state.lock();
        if state.session_id == Some(session_id) && state.mode == PropagatorMode::Streaming {
            state.mode = PropagatorMode::OnDemand;
        }
    }

    /// Apply one feed event to the current target.
    pub(super) async fn apply_change(&self, event: ChangeEvent) -> MirrorOutcome {
        crate::metrics::record_feed_event(&event.collection);

        let Some(target) = self.target() else {
            return MirrorOutcome::Skipped;
        };

        // A non-delete without a post-image would overwrite the mirrored fields with nothing.
        if !event.op.is_delete() && event.full_document.is_none() {
            warn!(
                collection = %event.collection,
                original_id = %event.document_key,
                op = %event.op,
                "Change event has no document, skipped"
            );
            crate::metrics::record_mirror_write(event.op.as_str(), "skipped");
            return MirrorOutcome::Skipped;
        }

        debug!(
            sequence = event.sequence,
            collection = %event.collection,
            original_id = %event.document_key,
            op = %event.op,
            "Applying change event"
        );

        match MirrorEnvelope::with_id(
            event.op,
            event.document_key.clone(),
            event.full_document.as_ref(),
            now_millis(),
        ) {
            Ok(envelope) => self.write_envelope(&target, &event.collection, envelope).await,
            Err(e) => {
                warn!(collection = %event.collection, error = %e, "Cannot build mirror envelope");
                crate::metrics::record_mirror_write(event.op.as_str(), "error");
                MirrorOutcome::Failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FailoverConfig;
    use crate::envelope::MutationOp;
    use crate::storage::memory::{InMemoryStore, MemoryConnector};
    use crate::storage::traits::DocumentStore;
    use crate::supervisor::ConnectionSupervisor;
    use serde_json::json;
    use std::time::Duration;

    async fn streaming() -> (Arc<ChangePropagator>, Arc<InMemoryStore>, Arc<InMemoryStore>) {
        let connector = Arc::new(MemoryConnector::new());
        let primary = connector.register("mem://primary");
        let mirror = connector.register("mem://mirror");
        let config = FailoverConfig {
            mirror_uri: Some("mem://mirror".into()),
            enable_health_monitoring: false,
            connect_attempts: 1,
            ..FailoverConfig::new("mem://primary")
        };
        let supervisor = ConnectionSupervisor::initialize(config.clone(), connector)
            .await
            .unwrap();
        let propagator = Arc::new(ChangePropagator::new(supervisor, &config));
        assert_eq!(propagator.start(true, None).await.mode, PropagatorMode::Streaming);
        (propagator, primary, mirror)
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_feed_events_reach_mirror_in_order() {
        let (propagator, primary, mirror) = streaming().await;

        let insert = ChangeEvent::from_document(
            "orders",
            MutationOp::Insert,
            json!({"_id": "o-1", "status": "new"}),
        )
        .unwrap();
        let update = ChangeEvent::from_document(
            "orders",
            MutationOp::Update,
            json!({"_id": "o-1", "status": "paid"}),
        )
        .unwrap();
        primary.record_mutation(&insert).await.unwrap();
        primary.record_mutation(&update).await.unwrap();
        primary.record_mutation(&ChangeEvent::delete("orders", "o-1")).await.unwrap();

        let m = mirror.clone();
        wait_for(move || {
            m.envelope("orders", "o-1")
                .is_some_and(|env| env.op == MutationOp::Delete)
        })
        .await;

        let env = mirror.find_envelope("orders", "o-1").await.unwrap().unwrap();
        assert_eq!(env.op, MutationOp::Delete);
        assert_eq!(env.fields["status"], "paid");
        propagator.stop().await;
    }

    #[tokio::test]
    async fn test_out_of_scope_collections_are_ignored() {
        let (propagator, primary, mirror) = streaming().await;

        let audit =
            ChangeEvent::from_document("auditlogs", MutationOp::Insert, json!({"_id": "a-1"}))
                .unwrap();
        let order =
            ChangeEvent::from_document("orders", MutationOp::Insert, json!({"_id": "o-2"}))
                .unwrap();
        primary.record_mutation(&audit).await.unwrap();
        primary.record_mutation(&order).await.unwrap();

        let m = mirror.clone();
        wait_for(move || m.envelope_count() == 1).await;
        assert_eq!(mirror.collection_len("auditlogs"), 0);
        propagator.stop().await;
    }

    #[tokio::test]
    async fn test_failed_event_does_not_stop_the_feed() {
        let (propagator, primary, mirror) = streaming().await;

        mirror.set_fail_writes(true);
        let first =
            ChangeEvent::from_document("orders", MutationOp::Insert, json!({"_id": "lost"}))
                .unwrap();
        primary.record_mutation(&first).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        mirror.set_fail_writes(false);
        let second =
            ChangeEvent::from_document("orders", MutationOp::Insert, json!({"_id": "kept"}))
                .unwrap();
        primary.record_mutation(&second).await.unwrap();

        let m = mirror.clone();
        wait_for(move || m.envelope_count() == 1).await;
        assert!(mirror.find_envelope("orders", "kept").await.unwrap().is_some());
        assert!(mirror.find_envelope("orders", "lost").await.unwrap().is_none());
        propagator.stop().await;
    }

    #[tokio::test]
    async fn test_ended_feed_falls_back_to_on_demand() {
        let (propagator, primary, mirror) = streaming().await;

        primary.end_feeds();
        let p = propagator.clone();
        wait_for(move || p.mode() == PropagatorMode::OnDemand).await;

        let outcome = propagator
            .mirror_document("orders", MutationOp::Insert, &json!({"_id": "o-9"}))
            .await;
        assert!(outcome.is_applied());
        assert!(mirror.find_envelope("orders", "o-9").await.unwrap().is_some());

        propagator.stop().await;
        assert_eq!(propagator.mode(), PropagatorMode::Stopped);
    }

    #[tokio::test]
    async fn test_update_without_document_is_skipped() {
        let (propagator, _primary, mirror) = streaming().await;
        let event = ChangeEvent {
            sequence: 1,
            collection: "orders".into(),
            op: MutationOp::Update,
            document_key: "o-1".into(),
            full_document: None,
        };
        assert_eq!(propagator.apply_change(event).await, MirrorOutcome::Skipped);
        assert_eq!(mirror.envelope_count(), 0);
        propagator.stop().await;
    }
}
