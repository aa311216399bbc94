// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the connection supervisor.

use serde::Serialize;

use super::handle::StoreRole;
use crate::storage::traits::ReadyState;

/// Snapshot returned by [`super::ConnectionSupervisor::get_database_status()`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseStatus {
    /// Store currently designated active
    pub current_connection: StoreRole,
    /// Set by automatic failover, cleared by failback or a manual switch
    pub is_failover_mode: bool,
    /// Operator pin, if any
    pub manual_override: Option<StoreRole>,
    pub primary_status: ReadyState,
    pub mirror_status: ReadyState,
}

/// Outcome of one liveness probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthProbeResult {
    pub available: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

impl HealthProbeResult {
    #[must_use]
    pub fn healthy(latency_ms: u64) -> Self {
        Self {
            available: true,
            latency_ms: Some(latency_ms),
            error: None,
        }
    }

    #[must_use]
    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            available: false,
            latency_ms: None,
            error: Some(error.into()),
        }
    }
}

/// Probe results for both stores from one health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub primary: HealthProbeResult,
    pub mirror: HealthProbeResult,
}

/// Result of a manual switch request. Refusals carry a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SwitchResult {
    pub success: bool,
    pub message: String,
}

impl SwitchResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// State-change notifications, delivered to every subscriber in emission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SupervisorEvent {
    Failover {
        from: StoreRole,
        to: StoreRole,
        timestamp: i64,
        automatic: bool,
    },
    SwitchToPrimary {
        timestamp: i64,
    },
    ManualSwitch {
        to: StoreRole,
        timestamp: i64,
    },
    HealthCheck {
        result: HealthReport,
    },
    FailoverFailed {
        error: String,
    },
}

impl SupervisorEvent {
    /// Event name as exposed to logging collaborators.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Failover { .. } => "failover",
            Self::SwitchToPrimary { .. } => "switch-to-primary",
            Self::ManualSwitch { .. } => "manual-switch",
            Self::HealthCheck { .. } => "health-check",
            Self::FailoverFailed { .. } => "failover-failed",
        }
    }
}
