// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change Data Capture (CDC) feed support.
//!
//! A [`ChangeFeed`] is an ordered stream of business mutations committed on the
//! primary store. Stores deliver events in commit order and never reorder them;
//! the streaming propagator relies on that to keep upserts and soft deletes
//! from overtaking each other.
//!
//! # Event Format
//!
//! ```text
//! seq=41  op=insert  coll=orders          key=o-1  doc={...}
//! seq=42  op=update  coll=orders          key=o-1  doc={...}
//! seq=43  op=delete  coll=inventoryitems  key=i-7  doc=None
//! ```
//!
//! Backends without a native feed implement it as an outbox table polled in
//! `seq` order (see [`crate::storage::sql`]).
//!
//! Feeds are bounded. A producer that can wait (the outbox poller) awaits
//! capacity, so a slow mirror throttles polling instead of growing memory.
//! A producer that cannot wait ends the feed when it is full.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::envelope::{original_id, MutationOp};
use crate::storage::traits::StorageError;

/// Events buffered between a store and a slow consumer.
pub const FEED_CAPACITY: usize = 1024;

/// One committed mutation on the primary store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// Position in the store's change log (monotonic per store)
    pub sequence: u64,
    /// Collection the document lives in
    pub collection: String,
    /// Mutation kind
    pub op: MutationOp,
    /// Identifier of the mutated document
    pub document_key: String,
    /// Post-image of the document (absent for deletes on some backends)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_document: Option<Value>,
}

impl ChangeEvent {
    /// Build an event from a business document; the key is read from `_id`/`id`.
    ///
    /// The sequence is assigned by the store when the event is recorded.
    pub fn from_document(
        collection: impl Into<String>,
        op: MutationOp,
        doc: Value,
    ) -> Result<Self, StorageError> {
        let document_key = original_id(&doc).ok_or_else(|| {
            StorageError::InvalidDocument("document has no _id or id field".to_string())
        })?;
        Ok(Self {
            sequence: 0,
            collection: collection.into(),
            op,
            document_key,
            full_document: Some(doc),
        })
    }

    /// Build a delete event that only carries the document key.
    pub fn delete(collection: impl Into<String>, document_key: impl Into<String>) -> Self {
        Self {
            sequence: 0,
            collection: collection.into(),
            op: MutationOp::Delete,
            document_key: document_key.into(),
            full_document: None,
        }
    }

    /// Whether this event falls inside a watch scope. An empty scope matches everything.
    #[must_use]
    pub fn in_scope(&self, collections: &[String]) -> bool {
        collections.is_empty() || collections.iter().any(|c| c == &self.collection)
    }
}

/// Ordered receiver side of a change subscription.
///
/// Dropping the feed unsubscribes; any background poller feeding it is aborted.
pub struct ChangeFeed {
    rx: mpsc::Receiver<ChangeEvent>,
    poller: Option<JoinHandle<()>>,
}

impl ChangeFeed {
    /// Create a connected sender/feed pair holding [`FEED_CAPACITY`] events.
    #[must_use]
    pub fn channel() -> (mpsc::Sender<ChangeEvent>, Self) {
        Self::bounded(FEED_CAPACITY)
    }

    #[must_use]
    pub fn bounded(capacity: usize) -> (mpsc::Sender<ChangeEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx, poller: None })
    }

    /// Attach the task producing events, so it is stopped with the feed.
    #[must_use]
    pub fn with_poller(mut self, poller: JoinHandle<()>) -> Self {
        self.poller = Some(poller);
        self
    }

    /// Next event in commit order, or `None` once the store side closed.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`next`](Self::next).
    pub fn try_next(&mut self) -> Option<ChangeEvent> {
        self.rx.try_recv().ok()
    }

    /// Stop receiving. Buffered events are discarded.
    pub fn close(&mut self) {
        self.rx.close();
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

impl Drop for ChangeFeed {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

impl std::fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("has_poller", &self.poller.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_document_reads_key() {
        let ev = ChangeEvent::from_document("orders", MutationOp::Insert, json!({"_id": "o-1"}))
            .unwrap();
        assert_eq!(ev.document_key, "o-1");
        assert_eq!(ev.collection, "orders");
        assert!(ev.full_document.is_some());
    }

    #[test]
    fn test_from_document_without_key_fails() {
        let result = ChangeEvent::from_document("orders", MutationOp::Insert, json!({"x": 1}));
        assert!(result.is_err());
    }

    #[test]
    fn test_delete_event_has_no_body() {
        let ev = ChangeEvent::delete("orders", "o-9");
        assert_eq!(ev.op, MutationOp::Delete);
        assert!(ev.full_document.is_none());
    }

    #[test]
    fn test_scope_matching() {
        let ev = ChangeEvent::delete("orders", "o-1");
        assert!(ev.in_scope(&[]));
        assert!(ev.in_scope(&["orders".to_string()]));
        assert!(!ev.in_scope(&["inventoryitems".to_string()]));
    }

    #[tokio::test]
    async fn test_feed_preserves_send_order() {
        let (tx, mut feed) = ChangeFeed::channel();
        for i in 0..5u64 {
            let mut ev = ChangeEvent::delete("orders", format!("o-{}", i));
            ev.sequence = i;
            tx.send(ev).await.unwrap();
        }
        drop(tx);

        let mut seen = Vec::new();
        while let Some(ev) = feed.next().await {
            seen.push(ev.sequence);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_close_stops_delivery() {
        let (tx, mut feed) = ChangeFeed::channel();
        feed.close();
        assert!(tx.send(ChangeEvent::delete("orders", "o-1")).await.is_err());
        assert!(feed.next().await.is_none());
    }

    #[tokio::test]
    async fn test_full_feed_holds_back_the_producer() {
        let (tx, mut feed) = ChangeFeed::bounded(2);
        tx.send(ChangeEvent::delete("orders", "o-1")).await.unwrap();
        tx.send(ChangeEvent::delete("orders", "o-2")).await.unwrap();
        assert!(tx.try_send(ChangeEvent::delete("orders", "o-3")).is_err());

        let producer = tokio::spawn(async move {
            tx.send(ChangeEvent::delete("orders", "o-3")).await.is_ok()
        });
        tokio::task::yield_now().await;
        assert!(!producer.is_finished());

        assert_eq!(feed.next().await.unwrap().document_key, "o-1");
        assert!(producer.await.unwrap());
        assert_eq!(feed.next().await.unwrap().document_key, "o-2");
        assert_eq!(feed.next().await.unwrap().document_key, "o-3");
    }
}
