// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connection supervisor: the single authority for which store is active.
//!
//! The supervisor owns both [`ConnectionHandle`]s and the active designation.
//! Two independent triggers can move the designation:
//!
//! - connection-level events (`connected`, `error`, `disconnected`) from the
//!   store drivers, handled by one listener task per physical store
//! - the health poll loop, which probes both stores every
//!   `health_check_interval_ms` and evaluates the result
//!
//! Both triggers funnel into the transition methods in `transitions.rs`, which
//! check and mutate the designation under one lock. Every transition bumps an
//! epoch; a poll cycle whose probes started before a transition discards its
//! evaluation instead of acting on a stale observation.
//!
//! # Example
//!
//! ```rust,no_run
//! use failover_mirror::{ConnectionSupervisor, FailoverConfig, StoreRole};
//! use failover_mirror::storage::sql::SqlConnector;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), failover_mirror::FailoverError> {
//! let config = FailoverConfig::from_env()?;
//! let connector = Arc::new(SqlConnector::new(config.feed_poll_interval()));
//! let supervisor = ConnectionSupervisor::initialize(config, connector).await?;
//!
//! let mut events = supervisor.subscribe();
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         println!("{}", event.name());
//!     }
//! });
//!
//! let result = supervisor.switch_database(StoreRole::Mirror);
//! println!("{}", result.message);
//!
//! supervisor.close().await;
//! # Ok(())
//! # }
//! ```

mod handle;
mod health;
mod lifecycle;
mod transitions;
mod types;

pub use handle::{ConnectionHandle, StoreRole};
pub use types::{DatabaseStatus, HealthProbeResult, HealthReport, SupervisorEvent, SwitchResult};

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::config::FailoverConfig;
use transitions::Designation;

/// Owner of the primary and mirror connections and the active designation.
///
/// Constructed once by the application root via
/// [`initialize`](Self::initialize) and shared as `Arc<ConnectionSupervisor>`.
pub struct ConnectionSupervisor {
    pub(super) config: FailoverConfig,
    pub(super) primary: Arc<ConnectionHandle>,
    pub(super) mirror: Arc<ConnectionHandle>,
    pub(super) designation: Mutex<Designation>,
    pub(super) events: broadcast::Sender<SupervisorEvent>,
    pub(super) last_health: RwLock<Option<HealthReport>>,
    /// Serializes health cycles so they never overlap
    pub(super) cycle_lock: tokio::sync::Mutex<()>,
    pub(super) shutdown: watch::Sender<bool>,
    pub(super) tasks: Mutex<Vec<JoinHandle<()>>>,
    pub(super) closed: AtomicBool,
}

impl ConnectionSupervisor {
    /// Current designation and readiness of both handles.
    #[must_use]
    pub fn get_database_status(&self) -> DatabaseStatus {
        let d = self.designation.lock();
        DatabaseStatus {
            current_connection: d.active,
            is_failover_mode: d.failover_mode,
            manual_override: d.manual_override,
            primary_status: self.primary.ready_state(),
            mirror_status: self.mirror.ready_state(),
        }
    }

    /// Handle of the store currently designated active.
    #[must_use]
    pub fn get_active_connection(&self) -> Arc<ConnectionHandle> {
        match self.designation.lock().active {
            StoreRole::Primary => self.primary.clone(),
            StoreRole::Mirror => self.mirror.clone(),
        }
    }

    /// Mirror handle. Aliases the primary's store in soft-mirror mode.
    #[must_use]
    pub fn get_mirror_connection(&self) -> Arc<ConnectionHandle> {
        self.mirror.clone()
    }

    #[must_use]
    pub fn get_primary_connection(&self) -> Arc<ConnectionHandle> {
        self.primary.clone()
    }

    /// Handle for `role`.
    #[must_use]
    pub fn connection(&self, role: StoreRole) -> Arc<ConnectionHandle> {
        match role {
            StoreRole::Primary => self.primary.clone(),
            StoreRole::Mirror => self.mirror.clone(),
        }
    }

    /// Whether the mirror handle points at the primary's store.
    #[must_use]
    pub fn is_mirror_aliased(&self) -> bool {
        self.mirror.shares_store(&self.primary)
    }

    /// Subscribe to state-change events.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Latest health report, if a check has run.
    #[must_use]
    pub fn last_health_report(&self) -> Option<HealthReport> {
        self.last_health.read().clone()
    }

    #[must_use]
    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(super) fn emit(&self, event: SupervisorEvent) {
        // No receivers is fine; events are observational.
        let _ = self.events.send(event);
    }
}

impl std::fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("primary", &self.primary)
            .field("mirror", &self.mirror)
            .field("status", &self.get_database_status())
            .finish()
    }
}
