// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::cdc::{ChangeEvent, ChangeFeed};
use crate::envelope::MirrorEnvelope;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Connection is closed")]
    Closed,
    #[error("Invalid document: {0}")]
    InvalidDocument(String),
}

/// Readiness of a store connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ReadyState {
    Disconnected = 0,
    Connected = 1,
    Connecting = 2,
    Disconnecting = 3,
}

impl ReadyState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Connecting => "connecting",
            Self::Disconnecting => "disconnecting",
        }
    }

    /// Decode from the `repr(u8)` value stored in an atomic.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connected,
            2 => Self::Connecting,
            3 => Self::Disconnecting,
            _ => Self::Disconnected,
        }
    }
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection-level lifecycle event emitted by a store driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Error(String),
    Disconnected,
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Error(msg) => write!(f, "error: {}", msg),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// One logical document-store connection.
///
/// Implementations must be cheap to share behind an `Arc`; the supervisor
/// hands the same instance to every collaborator.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Identity for logs and status (host/name).
    fn name(&self) -> &str;

    /// Current readiness as last observed by the driver.
    fn ready_state(&self) -> ReadyState;

    /// Subscribe to connection-level events (`connected`, `error`, `disconnected`).
    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Lightweight liveness probe.
    async fn ping(&self) -> Result<(), StorageError>;

    /// Insert or fully replace the envelope keyed by `(collection, envelope.original_id)`.
    async fn upsert_envelope(
        &self,
        collection: &str,
        envelope: &MirrorEnvelope,
    ) -> Result<(), StorageError>;

    /// Stamp `deletedAt`/`op = delete` on the envelope keyed by
    /// `(collection, envelope.original_id)`, keeping its existing fields.
    /// Inserts `envelope` as a tombstone if nothing was mirrored yet.
    async fn soft_delete(
        &self,
        collection: &str,
        envelope: &MirrorEnvelope,
    ) -> Result<(), StorageError>;

    /// Look up the envelope for one original document.
    async fn find_envelope(
        &self,
        collection: &str,
        original_id: &str,
    ) -> Result<Option<MirrorEnvelope>, StorageError>;

    /// Append a committed business mutation to this store's ordered change log.
    async fn record_mutation(&self, change: &ChangeEvent) -> Result<(), StorageError>;

    /// Open an ordered mutation feed scoped to `collections`.
    ///
    /// Only mutations recorded after the call are delivered.
    async fn watch(&self, collections: &[String]) -> Result<ChangeFeed, StorageError>;

    /// Close the connection. Idempotent.
    async fn close(&self) -> Result<(), StorageError>;
}

/// Opens store connections from a URI.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn DocumentStore>, StorageError>;
}
