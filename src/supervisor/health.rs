// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Liveness probes and the health poll loop.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::handle::ConnectionHandle;
use super::types::{HealthProbeResult, HealthReport, SupervisorEvent};
use super::ConnectionSupervisor;
use crate::error::FailoverError;

impl ConnectionSupervisor {
    /// Probe both stores concurrently.
    ///
    /// A soft mirror is not probed separately; it reports the primary's
    /// result. Never fails: probe errors land in the result's `error` field.
    pub async fn perform_health_check(&self) -> HealthReport {
        let timeout = self.config.probe_timeout();

        let report = if self.is_mirror_aliased() {
            let primary = probe(&self.primary, timeout).await;
            HealthReport {
                mirror: primary.clone(),
                primary,
            }
        } else {
            let (primary, mirror) =
                tokio::join!(probe(&self.primary, timeout), probe(&self.mirror, timeout));
            HealthReport { primary, mirror }
        };

        *self.last_health.write() = Some(report.clone());
        report
    }

    /// Run exactly one poll cycle: probe, emit `health-check`, evaluate.
    ///
    /// Cycles are serialized; a call made while another cycle is running waits
    /// for it to finish, including any transition it makes.
    pub async fn run_health_cycle(&self) -> HealthReport {
        let _cycle = self.cycle_lock.lock().await;

        let observed_epoch = self.designation_epoch();
        let report = self.perform_health_check().await;

        debug!(
            primary = report.primary.available,
            mirror = report.mirror.available,
            "Health check complete"
        );
        self.emit(SupervisorEvent::HealthCheck {
            result: report.clone(),
        });

        if !self.is_closed() {
            self.evaluate_health(&report, observed_epoch);
        }
        report
    }

    pub(super) fn spawn_health_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.config.health_check_interval();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately; the first cycle runs one period after start.
            ticker.tick().await;
            info!(interval_ms = period.as_millis() as u64, "Health monitoring started");

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                }

                let Some(supervisor) = weak.upgrade() else { break };
                supervisor.run_health_cycle().await;
            }
            debug!("Health monitoring stopped");
        })
    }
}

async fn probe(handle: &ConnectionHandle, timeout: Duration) -> HealthProbeResult {
    let store = handle.role().as_str();
    let started = Instant::now();

    let result = match tokio::time::timeout(timeout, handle.store().ping()).await {
        Ok(Ok(())) => {
            let elapsed = started.elapsed();
            crate::metrics::record_probe_latency(store, elapsed);
            crate::metrics::record_health_probe(store, "success");
            return HealthProbeResult::healthy(elapsed.as_millis() as u64);
        }
        Ok(Err(e)) => {
            crate::metrics::record_health_probe(store, "error");
            FailoverError::HealthProbe(format!("{}: {}", handle.name(), e))
        }
        Err(_) => {
            crate::metrics::record_health_probe(store, "timeout");
            FailoverError::HealthProbe(format!(
                "{}: ping timed out after {}ms",
                handle.name(),
                timeout.as_millis()
            ))
        }
    };

    debug!(%store, error = %result, "Health probe failed");
    HealthProbeResult::unhealthy(result.to_string())
}
