// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL document store (SQLite/MySQL through the sqlx `Any` driver).
//!
//! Envelopes live in one table keyed by `(collection, original_id)`, so the
//! "one envelope per original document" rule is enforced by the primary key:
//!
//! ```sql
//! CREATE TABLE mirror_envelopes (
//!   collection  VARCHAR(255) NOT NULL,
//!   original_id VARCHAR(255) NOT NULL,
//!   op          VARCHAR(16)  NOT NULL,   -- insert | update | replace | delete
//!   mirrored_at BIGINT       NOT NULL,   -- epoch millis
//!   deleted_at  BIGINT,                  -- set by soft deletes only
//!   fields      LONGTEXT     NOT NULL,   -- original document as JSON
//!   PRIMARY KEY (collection, original_id)
//! )
//! ```
//!
//! ## Change feed
//!
//! SQL has no native change stream, so committed business mutations are
//! appended to an outbox table and [`DocumentStore::watch`] polls it in
//! `seq` order:
//!
//! ```sql
//! CREATE TABLE change_outbox (
//!   seq           BIGINT AUTO_INCREMENT PRIMARY KEY,
//!   collection    VARCHAR(255) NOT NULL,
//!   op            VARCHAR(16)  NOT NULL,
//!   document_key  VARCHAR(255) NOT NULL,
//!   full_document LONGTEXT,
//!   recorded_at   BIGINT NOT NULL
//! )
//! ```
//!
//! MySQL hands out `AUTO_INCREMENT` values at insert time, not at commit, so
//! a poll can see `seq = 12` committed while `seq = 11` is still in flight.
//! The poller therefore only advances over a contiguous run of sequence
//! numbers. A hole holds delivery back until it fills or a grace period
//! passes; after that it is treated as a rolled-back insert and skipped.
//!
//! ## sqlx Any Driver Quirks
//!
//! JSON is stored as TEXT: the `Any` driver has no JSON type mapping, and it
//! hands MySQL TEXT columns back as BLOBs, so text columns are read as
//! `String` with a `Vec<u8>` fallback.

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::traits::{ConnectionEvent, DocumentStore, ReadyState, StorageError, StoreConnector};
use crate::cdc::{ChangeEvent, ChangeFeed};
use crate::config::redact_uri;
use crate::envelope::{now_millis, MirrorEnvelope, MutationOp};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// Rows fetched per outbox poll
const OUTBOX_PAGE: i64 = 500;

/// How long a hole in the outbox sequence may hold delivery back
const OUTBOX_GAP_GRACE: Duration = Duration::from_secs(5);

const EVENT_CAPACITY: usize = 64;

pub struct SqlStore {
    name: String,
    pool: AnyPool,
    is_sqlite: bool,
    ready: AtomicU8,
    events: broadcast::Sender<ConnectionEvent>,
    feed_poll_interval: Duration,
    gap_grace: Duration,
}

impl SqlStore {
    /// Open a pool, create the schema and return a connected store.
    pub async fn connect(
        connection_string: &str,
        feed_poll_interval: Duration,
    ) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");
        let pool = AnyPoolOptions::new()
            .max_connections(if is_sqlite { 5 } else { 20 })
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(300))
            .connect(connection_string)
            .await
            .map_err(|e| {
                StorageError::Unavailable(
                    e.to_string()
                        .replace(connection_string, &redact_uri(connection_string)),
                )
            })?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let store = Self {
            name: redact_uri(connection_string),
            pool,
            is_sqlite,
            ready: AtomicU8::new(ReadyState::Connecting as u8),
            events,
            feed_poll_interval,
            gap_grace: OUTBOX_GAP_GRACE,
        };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }
        store.init_schema().await?;

        store.set_ready(ReadyState::Connected);
        info!(store = %store.name, "SQL store connected");
        Ok(store)
    }

    /// How long feeds opened on this store wait for a missing outbox sequence.
    #[must_use]
    pub fn with_gap_grace(mut self, grace: Duration) -> Self {
        self.gap_grace = grace;
        self
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements: [&str; 2] = if self.is_sqlite {
            [
                r#"
                CREATE TABLE IF NOT EXISTS mirror_envelopes (
                    collection TEXT NOT NULL,
                    original_id TEXT NOT NULL,
                    op TEXT NOT NULL,
                    mirrored_at INTEGER NOT NULL,
                    deleted_at INTEGER,
                    fields TEXT NOT NULL,
                    PRIMARY KEY (collection, original_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS change_outbox (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    collection TEXT NOT NULL,
                    op TEXT NOT NULL,
                    document_key TEXT NOT NULL,
                    full_document TEXT,
                    recorded_at INTEGER NOT NULL
                )
                "#,
            ]
        } else {
            [
                r#"
                CREATE TABLE IF NOT EXISTS mirror_envelopes (
                    collection VARCHAR(255) NOT NULL,
                    original_id VARCHAR(255) NOT NULL,
                    op VARCHAR(16) NOT NULL,
                    mirrored_at BIGINT NOT NULL,
                    deleted_at BIGINT,
                    fields LONGTEXT NOT NULL,
                    PRIMARY KEY (collection, original_id),
                    INDEX idx_deleted_at (deleted_at)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS change_outbox (
                    seq BIGINT AUTO_INCREMENT PRIMARY KEY,
                    collection VARCHAR(255) NOT NULL,
                    op VARCHAR(16) NOT NULL,
                    document_key VARCHAR(255) NOT NULL,
                    full_document LONGTEXT,
                    recorded_at BIGINT NOT NULL
                )
                "#,
            ]
        };

        for sql in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("Failed to create schema: {}", e)))?;
        }
        Ok(())
    }

    fn set_ready(&self, state: ReadyState) {
        self.ready.store(state as u8, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        match self.ready_state() {
            ReadyState::Disconnecting => Err(StorageError::Closed),
            ReadyState::Disconnected if self.pool.is_closed() => Err(StorageError::Closed),
            _ => Ok(()),
        }
    }

    /// Upsert statement. `full` replaces every column; otherwise only the
    /// delete markers are touched and existing fields survive.
    fn upsert_sql(&self, full: bool) -> &'static str {
        match (self.is_sqlite, full) {
            (true, true) => {
                "INSERT INTO mirror_envelopes (collection, original_id, op, mirrored_at, deleted_at, fields) \
                 VALUES (?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(collection, original_id) DO UPDATE SET \
                    op = excluded.op, \
                    mirrored_at = excluded.mirrored_at, \
                    deleted_at = excluded.deleted_at, \
                    fields = excluded.fields"
            }
            (true, false) => {
                "INSERT INTO mirror_envelopes (collection, original_id, op, mirrored_at, deleted_at, fields) \
                 VALUES (?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(collection, original_id) DO UPDATE SET \
                    op = excluded.op, \
                    mirrored_at = excluded.mirrored_at, \
                    deleted_at = excluded.deleted_at"
            }
            (false, true) => {
                "INSERT INTO mirror_envelopes (collection, original_id, op, mirrored_at, deleted_at, fields) \
                 VALUES (?, ?, ?, ?, ?, ?) \
                 ON DUPLICATE KEY UPDATE \
                    op = VALUES(op), \
                    mirrored_at = VALUES(mirrored_at), \
                    deleted_at = VALUES(deleted_at), \
                    fields = VALUES(fields)"
            }
            (false, false) => {
                "INSERT INTO mirror_envelopes (collection, original_id, op, mirrored_at, deleted_at, fields) \
                 VALUES (?, ?, ?, ?, ?, ?) \
                 ON DUPLICATE KEY UPDATE \
                    op = VALUES(op), \
                    mirrored_at = VALUES(mirrored_at), \
                    deleted_at = VALUES(deleted_at)"
            }
        }
    }

    async fn write_envelope(
        &self,
        collection: &str,
        envelope: &MirrorEnvelope,
        full: bool,
    ) -> Result<(), StorageError> {
        self.ensure_open()?;
        let fields = serde_json::to_string(&envelope.fields)
            .map_err(|e| StorageError::InvalidDocument(e.to_string()))?;

        sqlx::query(self.upsert_sql(full))
            .bind(collection)
            .bind(&envelope.original_id)
            .bind(envelope.op.as_str())
            .bind(envelope.mirrored_at)
            .bind(envelope.deleted_at)
            .bind(&fields)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }
}

/// Read a TEXT column, handling the `Any` driver returning BLOBs for MySQL.
fn text_column(row: &AnyRow, column: &str) -> Option<String> {
    row.try_get::<String, _>(column).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(column)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

fn envelope_from_row(row: &AnyRow, original_id: &str) -> Result<MirrorEnvelope, StorageError> {
    let op: MutationOp = text_column(row, "op")
        .ok_or_else(|| StorageError::Backend("envelope row has no op".to_string()))?
        .parse()?;
    let mirrored_at: i64 = row.try_get("mirrored_at").unwrap_or(0);
    let deleted_at = row.try_get::<Option<i64>, _>("deleted_at").ok().flatten();
    let fields: Map<String, Value> = match text_column(row, "fields") {
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|e| StorageError::Backend(format!("corrupt envelope fields: {}", e)))?,
        None => Map::new(),
    };

    Ok(MirrorEnvelope {
        original_id: original_id.to_string(),
        op,
        mirrored_at,
        deleted_at,
        fields,
    })
}

fn change_from_row(row: &AnyRow) -> Result<ChangeEvent, StorageError> {
    let seq: i64 = row
        .try_get("seq")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    let collection = text_column(row, "collection").unwrap_or_default();
    let op: MutationOp = text_column(row, "op").unwrap_or_default().parse()?;
    let document_key = text_column(row, "document_key").unwrap_or_default();
    let full_document = match text_column(row, "full_document") {
        Some(raw) => Some(
            serde_json::from_str(&raw)
                .map_err(|e| StorageError::Backend(format!("corrupt outbox document: {}", e)))?,
        ),
        None => None,
    };

    Ok(ChangeEvent {
        sequence: seq.max(0) as u64,
        collection,
        op,
        document_key,
        full_document,
    })
}

/// Fetch one page of outbox rows after `after_seq`, in commit order.
///
/// Each row carries its sequence; the event is `None` when the row could
/// not be parsed.
async fn fetch_outbox(
    pool: &AnyPool,
    after_seq: i64,
) -> Result<Vec<(i64, Option<ChangeEvent>)>, StorageError> {
    let rows = sqlx::query(
        "SELECT seq, collection, op, document_key, full_document FROM change_outbox \
         WHERE seq > ? ORDER BY seq LIMIT ?",
    )
    .bind(after_seq)
    .bind(OUTBOX_PAGE)
    .fetch_all(pool)
    .await
    .map_err(|e| StorageError::Backend(e.to_string()))?;

    let mut page = Vec::with_capacity(rows.len());
    for row in &rows {
        let Ok(seq) = row.try_get::<i64, _>("seq") else {
            warn!("Skipping outbox row without a sequence");
            continue;
        };
        match change_from_row(row) {
            Ok(event) => page.push((seq, Some(event))),
            Err(e) => {
                warn!(seq, error = %e, "Skipping unreadable outbox row");
                page.push((seq, None));
            }
        }
    }
    Ok(page)
}

/// Delivery watermark over outbox sequence numbers.
///
/// Advances only over a contiguous run. A hole stops the run until the
/// missing row commits or `grace` has passed since the hole was first seen.
#[derive(Debug)]
struct OutboxCursor {
    last_seq: i64,
    grace: Duration,
    gap_since: Option<Instant>,
}

impl OutboxCursor {
    fn new(last_seq: i64, grace: Duration) -> Self {
        Self {
            last_seq,
            grace,
            gap_since: None,
        }
    }

    /// Number of leading `seqs` (ascending) that may be delivered now.
    fn advance(&mut self, seqs: &[i64], now: Instant) -> usize {
        let mut ready = 0;
        for &seq in seqs {
            if seq != self.last_seq + 1 {
                let since = *self.gap_since.get_or_insert(now);
                if now.duration_since(since) < self.grace {
                    break;
                }
                warn!(
                    from = self.last_seq + 1,
                    to = seq - 1,
                    "Outbox sequence hole outlived the grace period, skipping it"
                );
            }
            self.last_seq = seq;
            self.gap_since = None;
            ready += 1;
        }
        ready
    }
}


#[async_trait]
impl DocumentStore for SqlStore {
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
        self.ensure_open()?;
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => {
                let previous = self.ready.swap(ReadyState::Connected as u8, Ordering::SeqCst);
                if ReadyState::from_u8(previous) != ReadyState::Connected {
                    info!(store = %self.name, "SQL store reachable again");
                    let _ = self.events.send(ConnectionEvent::Connected);
                }
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                let previous = self.ready.swap(ReadyState::Disconnected as u8, Ordering::SeqCst);
                if ReadyState::from_u8(previous) == ReadyState::Connected {
                    warn!(store = %self.name, error = %message, "SQL store unreachable");
                    let _ = self.events.send(ConnectionEvent::Error(message.clone()));
                    let _ = self.events.send(ConnectionEvent::Disconnected);
                }
                Err(StorageError::Unavailable(message))
            }
        }
    }

    async fn upsert_envelope(
        &self,
        collection: &str,
        envelope: &MirrorEnvelope,
    ) -> Result<(), StorageError> {
        self.write_envelope(collection, envelope, true).await
    }

    async fn soft_delete(
        &self,
        collection: &str,
        envelope: &MirrorEnvelope,
    ) -> Result<(), StorageError> {
        let mut tombstone = envelope.clone();
        tombstone.mark_deleted(envelope.deleted_at.unwrap_or(envelope.mirrored_at));
        self.write_envelope(collection, &tombstone, false).await
    }

    async fn find_envelope(
        &self,
        collection: &str,
        original_id: &str,
    ) -> Result<Option<MirrorEnvelope>, StorageError> {
        self.ensure_open()?;
        let row = sqlx::query(
            "SELECT op, mirrored_at, deleted_at, fields FROM mirror_envelopes \
             WHERE collection = ? AND original_id = ?",
        )
        .bind(collection)
        .bind(original_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        row.map(|row| envelope_from_row(&row, original_id)).transpose()
    }

    async fn record_mutation(&self, change: &ChangeEvent) -> Result<(), StorageError> {
        self.ensure_open()?;
        let full_document = change
            .full_document
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StorageError::InvalidDocument(e.to_string()))?;

        sqlx::query(
            "INSERT INTO change_outbox (collection, op, document_key, full_document, recorded_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&change.collection)
        .bind(change.op.as_str())
        .bind(&change.document_key)
        .bind(full_document)
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn watch(&self, collections: &[String]) -> Result<ChangeFeed, StorageError> {
        self.ensure_open()?;
        let row = sqlx::query("SELECT COALESCE(MAX(seq), 0) AS seq FROM change_outbox")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let start: i64 = row.try_get("seq").unwrap_or(0);

        let (tx, feed) = ChangeFeed::channel();
        let pool = self.pool.clone();
        let scope = collections.to_vec();
        let period = self.feed_poll_interval;
        let store = self.name.clone();
        let grace = self.gap_grace;

        let poller = tokio::spawn(async move {
            let mut cursor = OutboxCursor::new(start, grace);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if tx.is_closed() || pool.is_closed() {
                    break;
                }
                match fetch_outbox(&pool, cursor.last_seq).await {
                    Ok(page) => {
                        let seqs: Vec<i64> = page.iter().map(|(seq, _)| *seq).collect();
                        let ready = cursor.advance(&seqs, Instant::now());
                        // Awaiting capacity holds the next page back until the consumer catches up.
                        let events = page.into_iter().take(ready).filter_map(|(_, event)| event);
                        for event in events.filter(|e| e.in_scope(&scope)) {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!(store = %store, error = %e, "Outbox poll failed"),
                }
            }
            debug!(store = %store, "Outbox poller stopped");
        });

        debug!(store = %self.name, start_seq = start, ?collections, "Change feed opened");
        Ok(feed.with_poller(poller))
    }

    async fn close(&self) -> Result<(), StorageError> {
        if self.pool.is_closed() {
            return Ok(());
        }
        self.set_ready(ReadyState::Disconnecting);
        self.pool.close().await;
        self.set_ready(ReadyState::Disconnected);
        let _ = self.events.send(ConnectionEvent::Disconnected);
        info!(store = %self.name, "SQL store closed");
        Ok(())
    }
}

/// Connector for `sqlite:` and `mysql:` URIs.
#[derive(Debug, Clone)]
pub struct SqlConnector {
    feed_poll_interval: Duration,
}

impl SqlConnector {
    #[must_use]
    pub fn new(feed_poll_interval: Duration) -> Self {
        Self { feed_poll_interval }
    }
}

impl Default for SqlConnector {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

#[async_trait]
impl StoreConnector for SqlConnector {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn DocumentStore>, StorageError> {
        let store = SqlStore::connect(uri, self.feed_poll_interval).await?;
        Ok(Arc::new(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> SqlStore {
        let path = dir.path().join("mirror.db");
        let uri = format!("sqlite://{}?mode=rwc", path.display());
        SqlStore::connect(&uri, Duration::from_millis(10)).await.unwrap()
    }

    fn envelope(id: &str, op: MutationOp, qty: i64, now: i64) -> MirrorEnvelope {
        MirrorEnvelope::from_document(op, &json!({"_id": id, "qty": qty}), now).unwrap()
    }

    #[tokio::test]
    async fn test_connect_is_ready_and_pings() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        assert_eq!(store.ready_state(), ReadyState::Connected);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_upsert_keeps_one_row_per_original_id() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        store.upsert_envelope("orders", &envelope("o-1", MutationOp::Insert, 1, 10)).await.unwrap();
        store.upsert_envelope("orders", &envelope("o-1", MutationOp::Update, 2, 20)).await.unwrap();

        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM mirror_envelopes")
            .fetch_one(&store.pool())
            .await
            .unwrap();
        let count: i64 = row.try_get("cnt").unwrap();
        assert_eq!(count, 1);

        let found = store.find_envelope("orders", "o-1").await.unwrap().unwrap();
        assert_eq!(found.op, MutationOp::Update);
        assert_eq!(found.fields["qty"], 2);
        assert_eq!(found.mirrored_at, 20);
    }

    #[tokio::test]
    async fn test_soft_delete_keeps_fields() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        store.upsert_envelope("orders", &envelope("o-1", MutationOp::Insert, 5, 10)).await.unwrap();
        let delete = MirrorEnvelope::with_id(MutationOp::Delete, "o-1".into(), None, 30).unwrap();
        store.soft_delete("orders", &delete).await.unwrap();

        let found = store.find_envelope("orders", "o-1").await.unwrap().unwrap();
        assert_eq!(found.op, MutationOp::Delete);
        assert_eq!(found.deleted_at, Some(30));
        assert_eq!(found.fields["qty"], 5);
    }

    #[tokio::test]
    async fn test_soft_delete_without_prior_record_inserts_tombstone() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        let delete = MirrorEnvelope::with_id(MutationOp::Delete, "ghost".into(), None, 7).unwrap();
        store.soft_delete("inventoryitems", &delete).await.unwrap();

        let found = store.find_envelope("inventoryitems", "ghost").await.unwrap().unwrap();
        assert!(found.is_deleted());
        assert!(found.fields.is_empty());
    }

    #[tokio::test]
    async fn test_find_missing_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        assert!(store.find_envelope("orders", "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_watch_delivers_new_mutations_in_order_and_in_scope() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        // Recorded before the watch; must not be replayed.
        store
            .record_mutation(&ChangeEvent::delete("orders", "old"))
            .await
            .unwrap();

        let mut feed = store.watch(&["orders".to_string()]).await.unwrap();

        let insert =
            ChangeEvent::from_document("orders", MutationOp::Insert, json!({"_id": "o-1", "qty": 1}))
                .unwrap();
        store.record_mutation(&insert).await.unwrap();
        store
            .record_mutation(&ChangeEvent::delete("inventoryitems", "i-1"))
            .await
            .unwrap();
        store
            .record_mutation(&ChangeEvent::delete("orders", "o-1"))
            .await
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), feed.next())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), feed.next())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(first.op, MutationOp::Insert);
        assert_eq!(first.document_key, "o-1");
        assert_eq!(first.full_document.unwrap()["qty"], 1);
        assert_eq!(second.op, MutationOp::Delete);
        assert!(first.sequence < second.sequence);
        assert!(feed.try_next().is_none());
    }

    #[test]
    fn test_cursor_advances_over_contiguous_run() {
        let now = Instant::now();
        let mut cursor = OutboxCursor::new(10, Duration::from_secs(5));
        assert_eq!(cursor.advance(&[11, 12, 13], now), 3);
        assert_eq!(cursor.last_seq, 13);
        assert_eq!(cursor.advance(&[], now), 0);
    }

    #[test]
    fn test_cursor_waits_at_hole_then_skips_after_grace() {
        let start = Instant::now();
        let mut cursor = OutboxCursor::new(10, Duration::from_secs(5));

        assert_eq!(cursor.advance(&[11, 13, 14], start), 1);
        assert_eq!(cursor.last_seq, 11);
        assert_eq!(cursor.advance(&[13, 14], start + Duration::from_secs(4)), 0);
        assert_eq!(cursor.last_seq, 11);

        assert_eq!(cursor.advance(&[13, 14], start + Duration::from_secs(5)), 2);
        assert_eq!(cursor.last_seq, 14);
        assert!(cursor.gap_since.is_none());
    }

    #[test]
    fn test_cursor_late_commit_fills_hole() {
        let start = Instant::now();
        let mut cursor = OutboxCursor::new(0, Duration::from_secs(5));

        assert_eq!(cursor.advance(&[2, 3], start), 0);
        assert_eq!(cursor.advance(&[1, 2, 3], start + Duration::from_millis(50)), 3);
        assert_eq!(cursor.last_seq, 3);
        assert!(cursor.gap_since.is_none());
    }

    #[tokio::test]
    async fn test_watch_holds_rows_behind_a_sequence_hole() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await.with_gap_grace(Duration::from_secs(60));
        let mut feed = store.watch(&[]).await.unwrap();

        let insert = "INSERT INTO change_outbox (seq, collection, op, document_key, full_document, recorded_at) \
                      VALUES (?, 'orders', 'delete', ?, NULL, 0)";
        sqlx::query(insert).bind(2_i64).bind("late-neighbour").execute(&store.pool()).await.unwrap();

        let held = tokio::time::timeout(Duration::from_millis(200), feed.next()).await;
        assert!(held.is_err(), "row after the hole must wait");

        sqlx::query(insert).bind(1_i64).bind("late-commit").execute(&store.pool()).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), feed.next())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), feed.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!((first.sequence, first.document_key.as_str()), (1, "late-commit"));
        assert_eq!((second.sequence, second.document_key.as_str()), (2, "late-neighbour"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_emits_disconnected() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let mut events = store.connection_events();

        store.close().await.unwrap();
        store.close().await.unwrap();

        assert_eq!(store.ready_state(), ReadyState::Disconnected);
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Disconnected);
        assert!(matches!(
            store.upsert_envelope("orders", &envelope("o-1", MutationOp::Insert, 1, 1)).await,
            Err(StorageError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_connector_opens_store() {
        let dir = TempDir::new().unwrap();
        let uri = format!("sqlite://{}?mode=rwc", dir.path().join("c.db").display());
        let store = SqlConnector::default().connect(&uri).await.unwrap();
        assert_eq!(store.ready_state(), ReadyState::Connected);
    }
}
