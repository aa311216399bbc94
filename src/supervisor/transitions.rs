// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Active-designation state machine.
//!
//! States are `{primary, mirror} x {no override, pinned primary, pinned mirror}`.
//! Every check and mutation happens under the designation lock, and events are
//! emitted before the lock is released, so subscribers see transitions in the
//! order they were applied. Nothing here awaits.

use tracing::{debug, info, warn};

use super::handle::StoreRole;
use super::types::{HealthReport, SupervisorEvent, SwitchResult};
use super::ConnectionSupervisor;
use crate::envelope::now_millis;
use crate::error::FailoverError;
use crate::storage::traits::ConnectionEvent;

/// Which store is active, plus the guards that arbitrate between triggers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Designation {
    pub active: StoreRole,
    pub manual_override: Option<StoreRole>,
    /// Set by automatic failover. Blocks a second failover and any automatic
    /// failback until `clear_manual_override`, `switch_to_primary` or a manual
    /// switch resets it.
    pub failover_mode: bool,
    /// Bumped on every transition
    pub epoch: u64,
}

impl Designation {
    pub(crate) fn new() -> Self {
        Self {
            active: StoreRole::Primary,
            manual_override: None,
            failover_mode: false,
            epoch: 0,
        }
    }
}

impl ConnectionSupervisor {
    /// Move the active designation to the mirror after a primary outage.
    ///
    /// No-op when a failover already happened, an operator pinned a store, or
    /// the mirror is already active. Emits `failover-failed` when the mirror
    /// is not connected. Returns whether the designation changed.
    pub fn perform_failover(&self) -> bool {
        let mut d = self.designation.lock();
        self.failover_locked(&mut d)
    }

    /// Return the active designation to the primary.
    ///
    /// Refused while an operator has pinned the mirror. Returns whether the
    /// designation changed.
    pub fn switch_to_primary(&self) -> bool {
        let mut d = self.designation.lock();
        self.switch_to_primary_locked(&mut d)
    }

    /// Operator switch to `target`, pinning it until
    /// [`clear_manual_override`](Self::clear_manual_override).
    ///
    /// Never fails with an error; refusals come back as `success: false`
    /// with the reason in `message`.
    pub fn switch_database(&self, target: StoreRole) -> SwitchResult {
        let handle = self.connection(target);

        if handle.shares_store(&self.connection(target.other())) {
            info!(%target, "Manual switch requested but mirror aliases primary, nothing to switch");
            return SwitchResult::ok(format!(
                "{} shares the same connection as {}, no switch needed",
                target,
                target.other()
            ));
        }

        if !handle.is_connected() {
            let reason = FailoverError::ManualSwitch(format!(
                "Cannot switch to {}: connection is {}",
                target,
                handle.ready_state()
            ));
            warn!(%target, state = %handle.ready_state(), "Manual switch refused");
            crate::metrics::record_transition("manual_switch_refused");
            return SwitchResult::refused(reason.to_string());
        }

        let mut d = self.designation.lock();
        d.manual_override = Some(target);
        d.active = target;
        d.failover_mode = false;
        d.epoch += 1;

        info!(%target, "Manual switch applied, automatic transitions suspended");
        crate::metrics::record_transition("manual_switch");
        crate::metrics::set_active_store(target);
        self.emit(SupervisorEvent::ManualSwitch {
            to: target,
            timestamp: now_millis(),
        });

        SwitchResult::ok(format!("Switched to {} (manual override set)", target))
    }

    /// Parse `target` and delegate to [`switch_database`](Self::switch_database).
    ///
    /// Unknown targets are refused, not errors.
    pub fn switch_database_by_name(&self, target: &str) -> SwitchResult {
        match target.parse::<StoreRole>() {
            Ok(role) => self.switch_database(role),
            Err(e) => SwitchResult::refused(e.to_string()),
        }
    }

    /// Drop any operator pin and release an automatic failover. If the
    /// primary is connected while the mirror is active, fail back immediately;
    /// otherwise the next primary `connected` event or healthy poll does.
    pub fn clear_manual_override(&self) {
        let mut d = self.designation.lock();
        let previous = d.manual_override.take();
        let released = std::mem::replace(&mut d.failover_mode, false);
        info!(previous = ?previous, released_failover = released, "Manual override cleared");

        if d.active == StoreRole::Mirror && self.primary.is_connected() {
            self.switch_to_primary_locked(&mut d);
        }
    }

    /// React to a connection-level event from one of the stores.
    pub(super) fn on_connection_event(&self, role: StoreRole, event: &ConnectionEvent) {
        if role == StoreRole::Mirror {
            match event {
                ConnectionEvent::Connected => info!("Mirror store connected"),
                ConnectionEvent::Error(e) => warn!(error = %e, "Mirror store connection error"),
                ConnectionEvent::Disconnected => warn!("Mirror store disconnected"),
            }
            return;
        }

        let mut d = self.designation.lock();
        match event {
            ConnectionEvent::Error(_) | ConnectionEvent::Disconnected => {
                let err = FailoverError::Connection {
                    store: self.primary.name().to_string(),
                    message: event.to_string(),
                };
                warn!(error = %err, "Primary store connection lost");
                if d.active == StoreRole::Primary && d.manual_override.is_none() {
                    self.failover_locked(&mut d);
                }
            }
            ConnectionEvent::Connected => {
                info!("Primary store connected");
                if d.failover_mode {
                    info!("Automatic failover in effect, staying on mirror until cleared");
                    return;
                }
                // Events can arrive late; only act if the primary is connected right now.
                if d.active == StoreRole::Mirror
                    && d.manual_override.is_none()
                    && self.primary.is_connected()
                {
                    self.switch_to_primary_locked(&mut d);
                }
            }
        }
    }

    /// Decide on a transition after a poll cycle.
    ///
    /// `observed_epoch` is the designation epoch from before the probes ran;
    /// if anything moved the designation since, the report is stale and
    /// ignored.
    pub(super) fn evaluate_health(&self, report: &HealthReport, observed_epoch: u64) {
        let mut d = self.designation.lock();

        if d.epoch != observed_epoch {
            debug!(observed_epoch, current_epoch = d.epoch, "Designation changed during health check, skipping evaluation");
            return;
        }
        if d.manual_override.is_some() {
            return;
        }

        match d.active {
            StoreRole::Primary if !report.primary.available && report.mirror.available => {
                warn!(error = ?report.primary.error, "Primary failed health check, mirror healthy");
                self.failover_locked(&mut d);
            }
            StoreRole::Mirror if report.primary.available && !d.failover_mode => {
                info!("Primary passed health check while mirror active");
                self.switch_to_primary_locked(&mut d);
            }
            _ => {}
        }
    }

    pub(super) fn designation_epoch(&self) -> u64 {
        self.designation.lock().epoch
    }

    fn failover_locked(&self, d: &mut Designation) -> bool {
        if d.failover_mode || d.active == StoreRole::Mirror {
            debug!("Failover already in effect");
            return false;
        }
        if let Some(pinned) = d.manual_override {
            debug!(%pinned, "Failover suppressed by manual override");
            return false;
        }
        if self.is_mirror_aliased() || !self.mirror.is_connected() {
            let error = format!(
                "Mirror not available for failover (state: {}{})",
                self.mirror.ready_state(),
                if self.is_mirror_aliased() { ", aliases primary" } else { "" }
            );
            warn!(%error, "Failover failed");
            crate::metrics::record_transition("failover_failed");
            self.emit(SupervisorEvent::FailoverFailed { error });
            return false;
        }

        d.active = StoreRole::Mirror;
        d.failover_mode = true;
        d.epoch += 1;

        warn!(from = "primary", to = "mirror", "Failover performed");
        crate::metrics::record_transition("failover");
        crate::metrics::set_active_store(StoreRole::Mirror);
        self.emit(SupervisorEvent::Failover {
            from: StoreRole::Primary,
            to: StoreRole::Mirror,
            timestamp: now_millis(),
            automatic: true,
        });
        true
    }

    fn switch_to_primary_locked(&self, d: &mut Designation) -> bool {
        if d.manual_override == Some(StoreRole::Mirror) {
            info!("Switch to primary refused, mirror is pinned by manual override");
            return false;
        }
        if d.active == StoreRole::Primary && !d.failover_mode {
            debug!("Primary already active");
            return false;
        }

        d.active = StoreRole::Primary;
        d.failover_mode = false;
        d.epoch += 1;

        info!("Switched back to primary");
        crate::metrics::record_transition("failback");
        crate::metrics::set_active_store(StoreRole::Primary);
        self.emit(SupervisorEvent::SwitchToPrimary {
            timestamp: now_millis(),
        });
        true
    }
}
