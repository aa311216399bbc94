// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process document store.
//!
//! Backs tests and demos, and doubles as a fault-injection harness: the
//! `simulate_*` methods drive the same connection events a network driver
//! would emit, and [`InMemoryStore::set_reachable`] flips liveness without
//! emitting anything (what a silent network partition looks like to pollers).

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::traits::{ConnectionEvent, DocumentStore, ReadyState, StorageError, StoreConnector};
use crate::cdc::{ChangeEvent, ChangeFeed, FEED_CAPACITY};
use crate::config::redact_uri;
use crate::envelope::MirrorEnvelope;

/// Capacity of the connection-event channel.
const EVENT_CAPACITY: usize = 64;

struct Watcher {
    collections: Vec<String>,
    tx: mpsc::Sender<ChangeEvent>,
}

pub struct InMemoryStore {
    name: String,
    ready: AtomicU8,
    reachable: AtomicBool,
    fail_writes: AtomicBool,
    /// Mirror envelopes keyed by (collection, original_id)
    envelopes: DashMap<(String, String), MirrorEnvelope>,
    /// Business documents recorded through `record_mutation`
    documents: DashMap<(String, String), serde_json::Value>,
    sequence: AtomicU64,
    watchers: Mutex<Vec<Watcher>>,
    feed_capacity: usize,
    events: broadcast::Sender<ConnectionEvent>,
}

impl InMemoryStore {
    /// Create a store in `Connected` state.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            name: name.into(),
            ready: AtomicU8::new(ReadyState::Connected as u8),
            reachable: AtomicBool::new(true),
            fail_writes: AtomicBool::new(false),
            envelopes: DashMap::new(),
            documents: DashMap::new(),
            sequence: AtomicU64::new(0),
            watchers: Mutex::new(Vec::new()),
            feed_capacity: FEED_CAPACITY,
            events,
        }
    }

    /// Buffer size of feeds opened on this store.
    #[must_use]
    pub fn with_feed_capacity(mut self, capacity: usize) -> Self {
        self.feed_capacity = capacity;
        self
    }

    /// Number of mirror envelopes held
    #[must_use]
    pub fn envelope_count(&self) -> usize {
        self.envelopes.len()
    }

    /// Number of envelopes in one collection
    #[must_use]
    pub fn collection_len(&self, collection: &str) -> usize {
        self.envelopes
            .iter()
            .filter(|entry| entry.key().0 == collection)
            .count()
    }

    /// Envelope stored for one original document
    #[must_use]
    pub fn envelope(&self, collection: &str, id: &str) -> Option<MirrorEnvelope> {
        self.envelopes
            .get(&(collection.to_string(), id.to_string()))
            .map(|r| r.value().clone())
    }

    /// Latest business document recorded for a key
    #[must_use]
    pub fn document(&self, collection: &str, id: &str) -> Option<serde_json::Value> {
        self.documents
            .get(&(collection.to_string(), id.to_string()))
            .map(|r| r.value().clone())
    }

    /// Number of open change feeds
    #[must_use]
    pub fn watcher_count(&self) -> usize {
        let mut watchers = self.watchers.lock();
        watchers.retain(|w| !w.tx.is_closed());
        watchers.len()
    }

    /// End every open change feed while staying connected, as when the
    /// server invalidates a change stream.
    pub fn end_feeds(&self) {
        self.watchers.lock().clear();
    }

    /// Toggle liveness without emitting connection events.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Make envelope writes fail while leaving pings healthy.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Drop the connection: readiness `disconnected`, unreachable, `disconnected` event.
    pub fn simulate_disconnect(&self) {
        self.reachable.store(false, Ordering::SeqCst);
        self.set_ready(ReadyState::Disconnected);
        let _ = self.events.send(ConnectionEvent::Disconnected);
    }

    /// Driver-level error: unreachable, readiness `disconnected`, `error` event.
    pub fn simulate_error(&self, message: &str) {
        self.reachable.store(false, Ordering::SeqCst);
        self.set_ready(ReadyState::Disconnected);
        let _ = self.events.send(ConnectionEvent::Error(message.to_string()));
    }

    /// Re-establish the connection and emit `connected`.
    pub fn simulate_reconnect(&self) {
        self.reachable.store(true, Ordering::SeqCst);
        self.set_ready(ReadyState::Connected);
        let _ = self.events.send(ConnectionEvent::Connected);
    }

    fn set_ready(&self, state: ReadyState) {
        self.ready.store(state as u8, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.ready_state() != ReadyState::Connected || !self.reachable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(format!("{} is not connected", self.name)));
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend(format!("{} rejected the write", self.name)));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.ready.load(Ordering::SeqCst))
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    async fn ping(&self) -> Result<(), StorageError> {
        if self.ready_state() == ReadyState::Connected && self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable(format!("{} did not answer ping", self.name)))
        }
    }

    async fn upsert_envelope(
        &self,
        collection: &str,
        envelope: &MirrorEnvelope,
    ) -> Result<(), StorageError> {
        self.check_writable()?;
        self.envelopes.insert(
            (collection.to_string(), envelope.original_id.clone()),
            envelope.clone(),
        );
        Ok(())
    }

    async fn soft_delete(
        &self,
        collection: &str,
        envelope: &MirrorEnvelope,
    ) -> Result<(), StorageError> {
        self.check_writable()?;
        let deleted_at = envelope.deleted_at.unwrap_or(envelope.mirrored_at);
        self.envelopes
            .entry((collection.to_string(), envelope.original_id.clone()))
            .and_modify(|existing| existing.mark_deleted(deleted_at))
            .or_insert_with(|| {
                let mut tombstone = envelope.clone();
                tombstone.mark_deleted(deleted_at);
                tombstone
            });
        Ok(())
    }

    async fn find_envelope(
        &self,
        collection: &str,
        original_id: &str,
    ) -> Result<Option<MirrorEnvelope>, StorageError> {
        Ok(self
            .envelopes
            .get(&(collection.to_string(), original_id.to_string()))
            .map(|r| r.value().clone()))
    }

    async fn record_mutation(&self, change: &ChangeEvent) -> Result<(), StorageError> {
        if self.ready_state() != ReadyState::Connected {
            return Err(StorageError::Unavailable(format!("{} is not connected", self.name)));
        }

        let mut event = change.clone();
        let key = (event.collection.clone(), event.document_key.clone());
        match (&event.full_document, event.op.is_delete()) {
            (_, true) => {
                self.documents.remove(&key);
            }
            (Some(doc), false) => {
                self.documents.insert(key, doc.clone());
            }
            (None, false) => {}
        }

        // Sequence assignment and fan-out happen under the watcher lock so
        // concurrent writers cannot interleave out of sequence order.
        let mut watchers = self.watchers.lock();
        event.sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        // A feed that fell a full buffer behind is ended rather than allowed to skip events.
        let name = &self.name;
        watchers.retain(|w| {
            if w.tx.is_closed() {
                return false;
            }
            if !event.in_scope(&w.collections) {
                return true;
            }
            match w.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(store = %name, sequence = event.sequence, "Change feed consumer fell behind, feed ended");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        Ok(())
    }

    async fn watch(&self, collections: &[String]) -> Result<ChangeFeed, StorageError> {
        if self.ready_state() != ReadyState::Connected {
            return Err(StorageError::Unavailable(format!("{} is not connected", self.name)));
        }
        let (tx, feed) = ChangeFeed::bounded(self.feed_capacity);
        self.watchers.lock().push(Watcher {
            collections: collections.to_vec(),
            tx,
        });
        debug!(store = %self.name, ?collections, "Change feed opened");
        Ok(feed)
    }

    async fn close(&self) -> Result<(), StorageError> {
        if self.ready_state() == ReadyState::Disconnected {
            return Ok(());
        }
        self.set_ready(ReadyState::Disconnecting);
        self.watchers.lock().clear();
        self.set_ready(ReadyState::Disconnected);
        let _ = self.events.send(ConnectionEvent::Disconnected);
        Ok(())
    }
}

/// Connector resolving URIs to pre-registered in-memory stores.
///
/// Unregistered URIs and URIs marked unreachable fail to connect, which is how
/// tests exercise bootstrap failure and the soft-mirror fallback.
#[derive(Default)]
pub struct MemoryConnector {
    stores: Mutex<HashMap<String, Arc<InMemoryStore>>>,
    unreachable: Mutex<Vec<String>>,
    connects: AtomicU64,
}

impl MemoryConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a store under `uri`, creating it. Returns the store for inspection.
    pub fn register(&self, uri: &str) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new(redact_uri(uri)));
        self.stores.lock().insert(uri.to_string(), store.clone());
        store
    }

    /// Make connects to `uri` fail.
    pub fn set_unreachable(&self, uri: &str) {
        self.unreachable.lock().push(uri.to_string());
    }

    /// Number of successful physical connects so far
    #[must_use]
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn DocumentStore>, StorageError> {
        if self.unreachable.lock().iter().any(|u| u == uri) {
            return Err(StorageError::Unavailable(format!("{} is unreachable", redact_uri(uri))));
        }
        let store = self
            .stores
            .lock()
            .get(uri)
            .cloned()
            .ok_or_else(|| StorageError::Unavailable(format!("no store registered at {}", redact_uri(uri))))?;
        store.simulate_reconnect();
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MutationOp;
    use serde_json::json;

    fn envelope(id: &str, op: MutationOp, now: i64) -> MirrorEnvelope {
        MirrorEnvelope::from_document(op, &json!({"_id": id, "qty": now}), now).unwrap()
    }

    #[tokio::test]
    async fn test_new_store_is_connected_and_empty() {
        let store = InMemoryStore::new("mem");
        assert_eq!(store.ready_state(), ReadyState::Connected);
        assert_eq!(store.envelope_count(), 0);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_upsert_overwrites_same_key() {
        let store = InMemoryStore::new("mem");
        store.upsert_envelope("orders", &envelope("o-1", MutationOp::Insert, 1)).await.unwrap();
        store.upsert_envelope("orders", &envelope("o-1", MutationOp::Update, 2)).await.unwrap();

        assert_eq!(store.envelope_count(), 1);
        let found = store.find_envelope("orders", "o-1").await.unwrap().unwrap();
        assert_eq!(found.op, MutationOp::Update);
        assert_eq!(found.fields["qty"], 2);
    }

    #[tokio::test]
    async fn test_same_id_in_different_collections_is_distinct() {
        let store = InMemoryStore::new("mem");
        store.upsert_envelope("orders", &envelope("x", MutationOp::Insert, 1)).await.unwrap();
        store.upsert_envelope("inventoryitems", &envelope("x", MutationOp::Insert, 1)).await.unwrap();

        assert_eq!(store.envelope_count(), 2);
        assert_eq!(store.collection_len("orders"), 1);
    }

    #[tokio::test]
    async fn test_soft_delete_keeps_fields() {
        let store = InMemoryStore::new("mem");
        store.upsert_envelope("orders", &envelope("o-1", MutationOp::Insert, 1)).await.unwrap();
        store.soft_delete("orders", &envelope("o-1", MutationOp::Delete, 9)).await.unwrap();

        let found = store.find_envelope("orders", "o-1").await.unwrap().unwrap();
        assert_eq!(found.op, MutationOp::Delete);
        assert_eq!(found.deleted_at, Some(9));
        assert_eq!(found.fields["qty"], 1);
    }

    #[tokio::test]
    async fn test_soft_delete_without_prior_record_inserts_tombstone() {
        let store = InMemoryStore::new("mem");
        store.soft_delete("orders", &envelope("ghost", MutationOp::Delete, 3)).await.unwrap();

        let found = store.find_envelope("orders", "ghost").await.unwrap().unwrap();
        assert!(found.is_deleted());
    }

    #[tokio::test]
    async fn test_disconnect_fails_ping_and_writes() {
        let store = InMemoryStore::new("mem");
        let mut events = store.connection_events();
        store.simulate_disconnect();

        assert_eq!(store.ready_state(), ReadyState::Disconnected);
        assert!(store.ping().await.is_err());
        assert!(store.upsert_envelope("orders", &envelope("o", MutationOp::Insert, 1)).await.is_err());
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Disconnected);
    }

    #[tokio::test]
    async fn test_unreachable_keeps_ready_state() {
        let store = InMemoryStore::new("mem");
        store.set_reachable(false);
        assert_eq!(store.ready_state(), ReadyState::Connected);
        assert!(store.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_watch_delivers_scoped_events_in_order() {
        let store = InMemoryStore::new("mem");
        let mut feed = store.watch(&["orders".to_string()]).await.unwrap();

        for i in 0..3 {
            let doc = json!({"_id": format!("o-{}", i)});
            store.record_mutation(&ChangeEvent::from_document("orders", MutationOp::Insert, doc).unwrap()).await.unwrap();
        }
        store.record_mutation(&ChangeEvent::delete("inventoryitems", "i-1")).await.unwrap();

        let mut keys = Vec::new();
        while let Some(ev) = feed.try_next() {
            keys.push((ev.sequence, ev.document_key));
        }
        assert_eq!(
            keys,
            vec![(1, "o-0".to_string()), (2, "o-1".to_string()), (3, "o-2".to_string())]
        );
    }

    #[tokio::test]
    async fn test_lagging_feed_is_ended_not_gapped() {
        let store = InMemoryStore::new("mem").with_feed_capacity(2);
        let mut feed = store.watch(&[]).await.unwrap();

        for i in 0..3 {
            let doc = json!({"_id": format!("o-{}", i)});
            store.record_mutation(&ChangeEvent::from_document("orders", MutationOp::Insert, doc).unwrap()).await.unwrap();
        }

        assert_eq!(feed.next().await.unwrap().document_key, "o-0");
        assert_eq!(feed.next().await.unwrap().document_key, "o-1");
        assert!(feed.next().await.is_none());
        assert_eq!(store.watcher_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_feed_is_pruned() {
        let store = InMemoryStore::new("mem");
        let feed = store.watch(&[]).await.unwrap();
        assert_eq!(store.watcher_count(), 1);
        drop(feed);
        assert_eq!(store.watcher_count(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let store = InMemoryStore::new("mem");
        store.close().await.unwrap();
        store.close().await.unwrap();
        assert_eq!(store.ready_state(), ReadyState::Disconnected);
    }

    #[tokio::test]
    async fn test_connector_counts_and_rejects() {
        let connector = MemoryConnector::new();
        connector.register("mem://primary");
        connector.register("mem://mirror");
        connector.set_unreachable("mem://mirror");

        assert!(connector.connect("mem://primary").await.is_ok());
        assert!(connector.connect("mem://mirror").await.is_err());
        assert!(connector.connect("mem://nowhere").await.is_err());
        assert_eq!(connector.connect_count(), 1);
    }
}
