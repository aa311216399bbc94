// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Supervisor lifecycle: bootstrap, connection listeners, shutdown.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::handle::{ConnectionHandle, StoreRole};
use super::transitions::Designation;
use super::ConnectionSupervisor;
use crate::config::{redact_uri, FailoverConfig};
use crate::error::FailoverError;
use crate::resilience::retry::{retry, RetryPolicy};
use crate::storage::traits::StoreConnector;

impl ConnectionSupervisor {
    /// Connect both stores and start background monitoring.
    ///
    /// Startup flow:
    /// 1. Connect the primary. Failure is fatal ([`FailoverError::Bootstrap`]).
    /// 2. Connect the mirror. Failure, a missing URI or a URI equal to the
    ///    primary's leaves the mirror handle aliasing the primary's store.
    /// 3. Subscribe to connection events of each distinct store.
    /// 4. Start the health poll loop unless monitoring is disabled.
    #[tracing::instrument(skip(config, connector), fields(primary = %redact_uri(&config.primary_uri)))]
    pub async fn initialize(
        config: FailoverConfig,
        connector: Arc<dyn StoreConnector>,
    ) -> Result<Arc<Self>, FailoverError> {
        config.validate()?;
        let policy = RetryPolicy::bootstrap(config.connect_attempts);

        let primary_store = retry("connect_primary", &policy, || {
            connector.connect(&config.primary_uri)
        })
        .await
        .map_err(|source| {
            error!(error = %source, "Primary store unreachable at startup");
            FailoverError::Bootstrap {
                uri: redact_uri(&config.primary_uri),
                source,
            }
        })?;
        let primary = Arc::new(ConnectionHandle::new(
            StoreRole::Primary,
            &config.primary_uri,
            primary_store,
        ));
        info!(store = %primary.name(), "Primary store connected");

        let mirror = match config.distinct_mirror_uri() {
            None => {
                info!("No distinct mirror URI, mirror writes go to the primary store");
                ConnectionHandle::alias_of(&primary)
            }
            Some(uri) => match retry("connect_mirror", &policy, || connector.connect(uri)).await {
                Ok(store) => {
                    info!(store = %store.name(), "Mirror store connected");
                    ConnectionHandle::new(StoreRole::Mirror, uri, store)
                }
                Err(e) => {
                    warn!(error = %e, "Mirror store unreachable, falling back to soft mirror on primary");
                    ConnectionHandle::alias_of(&primary)
                }
            },
        };

        let (events, _) = broadcast::channel(config.event_capacity);
        let (shutdown, _) = watch::channel(false);
        let monitoring = config.enable_health_monitoring;

        let supervisor = Arc::new(Self {
            config,
            primary,
            mirror: Arc::new(mirror),
            designation: Mutex::new(Designation::new()),
            events,
            last_health: RwLock::new(None),
            cycle_lock: tokio::sync::Mutex::new(()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        crate::metrics::set_active_store(StoreRole::Primary);

        let mut tasks = vec![supervisor.spawn_listener(StoreRole::Primary)];
        if !supervisor.is_mirror_aliased() {
            tasks.push(supervisor.spawn_listener(StoreRole::Mirror));
        }
        if monitoring {
            tasks.push(supervisor.spawn_health_loop());
        } else {
            info!("Health monitoring disabled");
        }
        *supervisor.tasks.lock() = tasks;

        info!(
            aliased = supervisor.is_mirror_aliased(),
            monitoring, "Connection supervisor initialized"
        );
        Ok(supervisor)
    }

    /// Stop background work, then close the primary and the mirror.
    ///
    /// The mirror is not closed separately when it aliases the primary.
    /// Idempotent.
    #[tracing::instrument(skip(self))]
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing connection supervisor");

        let _ = self.shutdown.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            // Transitions never await, so aborting mid-cycle cannot tear one.
            task.abort();
            let _ = task.await;
        }

        if let Err(e) = self.primary.store().close().await {
            warn!(error = %e, "Failed to close primary store");
        }
        if !self.is_mirror_aliased() {
            if let Err(e) = self.mirror.store().close().await {
                warn!(error = %e, "Failed to close mirror store");
            }
        }
        info!("Connection supervisor closed");
    }

    fn spawn_listener(self: &Arc<Self>, role: StoreRole) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        // Subscribe before spawning so no event after initialize() is missed.
        let mut rx = self.connection(role).store().connection_events();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    received = rx.recv() => match received {
                        Ok(event) => {
                            let Some(supervisor) = weak.upgrade() else { break };
                            supervisor.on_connection_event(role, &event);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(%role, skipped, "Connection events lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!(%role, "Connection listener stopped");
        })
    }
}
