// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Failover-layer error taxonomy.
//!
//! Only [`FailoverError::Bootstrap`] and [`FailoverError::Config`] are ever
//! returned to callers. The remaining variants are rendered into log lines,
//! probe results and [`SwitchResult`](crate::SwitchResult) messages so one
//! formatting path covers every degradation.

use thiserror::Error;

use crate::storage::traits::StorageError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FailoverError {
    /// Primary store unreachable at startup; the process has no usable store
    #[error("bootstrap failed, primary store {uri} unreachable: {source}")]
    Bootstrap {
        uri: String,
        #[source]
        source: StorageError,
    },

    #[error("connection error on {store}: {message}")]
    Connection { store: String, message: String },

    #[error("health probe failed: {0}")]
    HealthProbe(String),

    #[error("mirror write failed for {collection}/{original_id}: {message}")]
    MirrorWrite {
        collection: String,
        original_id: String,
        message: String,
    },

    #[error("{0}")]
    ManualSwitch(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl FailoverError {
    /// Whether this error must halt process startup.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Bootstrap { .. } | Self::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_bootstrap_and_config_are_fatal() {
        let boot = FailoverError::Bootstrap {
            uri: "sqlite:a.db".into(),
            source: StorageError::Unavailable("refused".into()),
        };
        assert!(boot.is_fatal());
        assert!(FailoverError::Config("x".into()).is_fatal());
        assert!(!FailoverError::HealthProbe("timeout".into()).is_fatal());
        assert!(!FailoverError::ManualSwitch("no".into()).is_fatal());
    }

    #[test]
    fn test_bootstrap_message_names_uri() {
        let boot = FailoverError::Bootstrap {
            uri: "sqlite:a.db".into(),
            source: StorageError::Unavailable("refused".into()),
        };
        let msg = boot.to_string();
        assert!(msg.contains("sqlite:a.db"));
        assert!(msg.contains("refused"));
    }
}
