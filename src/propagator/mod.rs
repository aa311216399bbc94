// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change propagator: applies business mutations to the mirror store.
//!
//! Two delivery modes, chosen at [`start`](ChangePropagator::start):
//!
//! ```text
//!   streaming:  primary change feed ──► worker (one event at a time) ──┐
//!                                                                     ├──► mirror store
//!   on-demand:  business write ──► mirror_document(collection, op, doc)┘
//! ```
//!
//! Every write builds a [`MirrorEnvelope`]. Inserts, updates and replaces
//! upsert by `originalId`; deletes stamp `deletedAt` and never remove the
//! envelope.
//!
//! Mirror writes are best-effort. A failed write is logged and dropped: it
//! never reaches the caller and never stops the feed. There is no replay
//! queue, so writes lost during a mirror outage stay lost.

mod streaming;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::FailoverConfig;
use crate::envelope::{now_millis, MirrorEnvelope, MutationOp};
use crate::error::FailoverError;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::storage::traits::StorageError;
use crate::supervisor::{ConnectionHandle, ConnectionSupervisor};

/// How the propagator is currently delivering mirror writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PropagatorMode {
    Stopped,
    OnDemand,
    Streaming,
}

/// Snapshot returned by [`ChangePropagator::start`] and [`ChangePropagator::state`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PropagatorState {
    pub mode: PropagatorMode,
    /// Whether `stop()` closes the target connection
    pub owns_target: bool,
    /// Identifies one start/stop run in logs
    pub session_id: Option<Uuid>,
}

impl PropagatorState {
    fn stopped() -> Self {
        Self {
            mode: PropagatorMode::Stopped,
            owns_target: false,
            session_id: None,
        }
    }
}

/// Result of one mirror write. Never an error: failures are already logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorOutcome {
    Applied,
    /// Nothing was written (not started, or the feed covers it)
    Skipped,
    Failed(String),
}

impl MirrorOutcome {
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

struct Worker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct ChangePropagator {
    supervisor: Arc<ConnectionSupervisor>,
    collections: Vec<String>,
    write_timeout: Duration,
    breaker: CircuitBreaker,
    target: RwLock<Option<Arc<ConnectionHandle>>>,
    state: Mutex<PropagatorState>,
    worker: Mutex<Option<Worker>>,
    /// Serializes start/stop
    lifecycle: tokio::sync::Mutex<()>,
}

impl ChangePropagator {
    pub fn new(supervisor: Arc<ConnectionSupervisor>, config: &FailoverConfig) -> Self {
        Self {
            supervisor,
            collections: config.mirrored_collections.clone(),
            write_timeout: config.mirror_write_timeout(),
            breaker: CircuitBreaker::for_mirror_writes(),
            target: RwLock::new(None),
            state: Mutex::new(PropagatorState::stopped()),
            worker: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Wire the mirror path, optionally subscribing to the primary's change feed.
    ///
    /// Idempotent: once started, further calls return the current state
    /// unchanged. `mirror_override` replaces the supervisor's mirror handle as
    /// the write target; the propagator owns (and closes on `stop`) an
    /// override that is not one of the supervisor's connections.
    ///
    /// If the primary cannot open a feed, the propagator falls back to
    /// on-demand mode.
    #[tracing::instrument(skip(self, mirror_override))]
    pub async fn start(
        self: &Arc<Self>,
        enable_streaming: bool,
        mirror_override: Option<Arc<ConnectionHandle>>,
    ) -> PropagatorState {
        let _lifecycle = self.lifecycle.lock().await;

        let current = self.state();
        if current.mode != PropagatorMode::Stopped {
            debug!(mode = ?current.mode, "Propagator already started");
            return current;
        }

        let primary = self.supervisor.get_primary_connection();
        let supervisor_mirror = self.supervisor.get_mirror_connection();
        let owns_target = mirror_override.as_ref().is_some_and(|handle| {
            !handle.shares_store(&primary) && !handle.shares_store(&supervisor_mirror)
        });
        let target = mirror_override.unwrap_or(supervisor_mirror);
        *self.target.write() = Some(target.clone());

        let session_id = Uuid::new_v4();
        let mode = if enable_streaming {
            match primary.store().watch(&self.collections).await {
                Ok(feed) => {
                    let (shutdown, shutdown_rx) = watch::channel(false);
                    let handle = self.spawn_feed_worker(feed, shutdown_rx, session_id);
                    *self.worker.lock() = Some(Worker { shutdown, handle });
                    PropagatorMode::Streaming
                }
                Err(e) => {
                    warn!(error = %e, "Change feed unavailable, falling back to on-demand mirroring");
                    PropagatorMode::OnDemand
                }
            }
        } else {
            PropagatorMode::OnDemand
        };

        let state = PropagatorState {
            mode,
            owns_target,
            session_id: Some(session_id),
        };
        *self.state.lock() = state.clone();

        info!(
            %session_id,
            mode = ?mode,
            target = %target.name(),
            owns_target,
            collections = ?self.collections,
            "Change propagator started"
        );
        state
    }

    /// Stop the feed worker (if any), then release the target.
    ///
    /// The target connection is closed only when this propagator owns it.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.shutdown.send(true);
            if let Err(e) = worker.handle.await {
                warn!(error = %e, "Feed worker ended abnormally");
            }
        }

        let state = std::mem::replace(&mut *self.state.lock(), PropagatorState::stopped());
        let target = self.target.write().take();
        if let (Some(target), true) = (target, state.owns_target) {
            if let Err(e) = target.store().close().await {
                warn!(error = %e, "Failed to close owned mirror connection");
            }
        }

        if state.mode != PropagatorMode::Stopped {
            info!(session_id = ?state.session_id, "Change propagator stopped");
        }
    }

    #[must_use]
    pub fn state(&self) -> PropagatorState {
        self.state.lock().clone()
    }

    #[must_use]
    pub fn mode(&self) -> PropagatorMode {
        self.state.lock().mode
    }

    /// Current write target, if started.
    #[must_use]
    pub fn target(&self) -> Option<Arc<ConnectionHandle>> {
        self.target.read().clone()
    }

    /// Whether mirror writes reach a store other than the primary.
    #[must_use]
    pub fn is_mirror_configured(&self) -> bool {
        let primary = self.supervisor.get_primary_connection();
        match self.target() {
            Some(target) => !target.shares_store(&primary),
            None => !self.supervisor.is_mirror_aliased(),
        }
    }

    #[must_use]
    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Mirror one committed mutation of `doc` in `collection`.
    ///
    /// Returns [`MirrorOutcome::Skipped`] before `start`. Failures are logged
    /// at warn and reported as [`MirrorOutcome::Failed`]; they never panic or
    /// propagate.
    pub async fn mirror_document(
        &self,
        collection: &str,
        op: MutationOp,
        doc: &Value,
    ) -> MirrorOutcome {
        let Some(target) = self.target() else {
            debug!(collection, "Propagator not started, mirror write skipped");
            crate::metrics::record_mirror_write(op.as_str(), "skipped");
            return MirrorOutcome::Skipped;
        };

        match MirrorEnvelope::from_document(op, doc, now_millis()) {
            Ok(envelope) => self.write_envelope(&target, collection, envelope).await,
            Err(e) => {
                warn!(collection, op = %op, error = %e, "Cannot build mirror envelope");
                crate::metrics::record_mirror_write(op.as_str(), "error");
                MirrorOutcome::Failed(e.to_string())
            }
        }
    }

    /// Write one envelope through the breaker, bounded by the write timeout.
    async fn write_envelope(
        &self,
        target: &ConnectionHandle,
        collection: &str,
        envelope: MirrorEnvelope,
    ) -> MirrorOutcome {
        let op = envelope.op;
        let original_id = envelope.original_id.clone();
        let store = target.store().clone();
        let timeout = self.write_timeout;

        let result = self
            .breaker
            .call(|| async move {
                let write = async {
                    if op.is_delete() {
                        store.soft_delete(collection, &envelope).await
                    } else {
                        store.upsert_envelope(collection, &envelope).await
                    }
                };
                match tokio::time::timeout(timeout, write).await {
                    Ok(result) => result,
                    Err(_) => Err(StorageError::Unavailable(format!(
                        "mirror write timed out after {}ms",
                        timeout.as_millis()
                    ))),
                }
            })
            .await;

        match result {
            Ok(()) => {
                debug!(collection, original_id = %original_id, op = %op, "Mirrored");
                crate::metrics::record_mirror_write(op.as_str(), "success");
                MirrorOutcome::Applied
            }
            Err(e) => {
                let status = match &e {
                    CircuitError::Rejected => "rejected",
                    CircuitError::Inner(_) => "error",
                };
                let err = FailoverError::MirrorWrite {
                    collection: collection.to_string(),
                    original_id,
                    message: e.to_string(),
                };
                warn!(error = %err, op = %op, "Mirror write dropped");
                crate::metrics::record_mirror_write(op.as_str(), status);
                MirrorOutcome::Failed(err.to_string())
            }
        }
    }
}

impl std::fmt::Debug for ChangePropagator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangePropagator")
            .field("state", &self.state())
            .field("collections", &self.collections)
            .finish()
    }
}
