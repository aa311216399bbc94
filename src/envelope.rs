// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mirror envelope: the record written to the mirror store.
//!
//! An envelope is the original document's fields plus mirroring metadata:
//!
//! ```text
//! { ...original fields (minus _id),
//!   "originalId": "64f1c0...",
//!   "op":         "insert" | "update" | "replace" | "delete",
//!   "mirroredAt": 1735776000000,
//!   "deletedAt":  1735776000000     // only once soft-deleted
//! }
//! ```
//!
//! There is exactly one envelope per `(collection, originalId)`. Deletes never
//! remove the envelope, they stamp `deletedAt` and `op = "delete"`.
//!
//! # Example
//!
//! ```
//! use failover_mirror::{MirrorEnvelope, MutationOp};
//! use serde_json::json;
//!
//! let doc = json!({"_id": "sku-1", "name": "Widget", "qty": 4});
//! let env = MirrorEnvelope::from_document(MutationOp::Insert, &doc, 1_000).unwrap();
//!
//! assert_eq!(env.original_id, "sku-1");
//! assert_eq!(env.fields["qty"], 4);
//! assert!(!env.fields.contains_key("_id"));
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::storage::traits::StorageError;

/// Kind of mutation applied to a business document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationOp {
    Insert,
    Update,
    Replace,
    Delete,
}

impl MutationOp {
    /// Returns the wire/string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationOp::Insert => "insert",
            MutationOp::Update => "update",
            MutationOp::Replace => "replace",
            MutationOp::Delete => "delete",
        }
    }

    /// Whether this op is applied as a soft delete rather than an upsert.
    #[must_use]
    pub fn is_delete(&self) -> bool {
        matches!(self, MutationOp::Delete)
    }
}

impl fmt::Display for MutationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationOp {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "insert" => Ok(MutationOp::Insert),
            "update" => Ok(MutationOp::Update),
            "replace" => Ok(MutationOp::Replace),
            "delete" => Ok(MutationOp::Delete),
            other => Err(StorageError::InvalidDocument(format!(
                "unknown mutation op '{}'",
                other
            ))),
        }
    }
}

/// The record stored in the mirror for one business document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorEnvelope {
    /// Identifier of the document in the primary store
    pub original_id: String,
    /// Last mutation mirrored for this document
    pub op: MutationOp,
    /// When the last mirror write happened (epoch millis)
    pub mirrored_at: i64,
    /// Set once the document was deleted on the primary (epoch millis)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
    /// Original document fields, `_id` stripped
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl MirrorEnvelope {
    /// Build an envelope for `op` applied to `doc` at `now` (epoch millis).
    ///
    /// Fails with [`StorageError::InvalidDocument`] if `doc` is not an object
    /// or carries no usable identifier.
    pub fn from_document(op: MutationOp, doc: &Value, now: i64) -> Result<Self, StorageError> {
        let original_id = original_id(doc).ok_or_else(|| {
            StorageError::InvalidDocument("document has no _id or id field".to_string())
        })?;
        Self::with_id(op, original_id, Some(doc), now)
    }

    /// Build an envelope when the id is known separately from the body.
    ///
    /// Change feeds may deliver deletes (and some updates) with only a
    /// document key, so `doc` is optional.
    pub fn with_id(
        op: MutationOp,
        original_id: String,
        doc: Option<&Value>,
        now: i64,
    ) -> Result<Self, StorageError> {
        let mut fields = match doc {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(other) => {
                return Err(StorageError::InvalidDocument(format!(
                    "expected a JSON object, got {}",
                    json_kind(other)
                )))
            }
        };
        fields.remove("_id");
        // Metadata keys always win over same-named document fields.
        for key in ["originalId", "op", "mirroredAt", "deletedAt"] {
            fields.remove(key);
        }

        Ok(Self {
            original_id,
            op,
            mirrored_at: now,
            deleted_at: if op.is_delete() { Some(now) } else { None },
            fields,
        })
    }

    /// Whether this envelope records a deleted document.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Apply a soft delete on top of an existing envelope, keeping its fields.
    pub fn mark_deleted(&mut self, deleted_at: i64) {
        self.op = MutationOp::Delete;
        self.mirrored_at = deleted_at;
        self.deleted_at = Some(deleted_at);
    }

    /// Render the envelope as the flat JSON document stored in the mirror.
    #[must_use]
    pub fn to_document(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Extract the primary-store identifier from a document.
///
/// Looks at `_id` first, then `id`. Accepts strings, numbers and the
/// extended-JSON `{"$oid": "..."}` form.
#[must_use]
pub fn original_id(doc: &Value) -> Option<String> {
    let obj = doc.as_object()?;
    obj.get("_id")
        .and_then(id_to_string)
        .or_else(|| obj.get("id").and_then(id_to_string))
}

fn id_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => map.get("$oid").and_then(|v| v.as_str()).map(String::from),
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Current wall-clock time in epoch millis.
#[must_use]
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_original_id_prefers_underscore_id() {
        let doc = json!({"_id": "a", "id": "b"});
        assert_eq!(original_id(&doc), Some("a".to_string()));
    }

    #[test]
    fn test_original_id_falls_back_to_id() {
        assert_eq!(original_id(&json!({"id": 42})), Some("42".to_string()));
        assert_eq!(original_id(&json!({"_id": ""})), None);
    }

    #[test]
    fn test_original_id_extended_json_oid() {
        let doc = json!({"_id": {"$oid": "64f1c0ffee"}});
        assert_eq!(original_id(&doc), Some("64f1c0ffee".to_string()));
    }

    #[test]
    fn test_original_id_missing() {
        assert_eq!(original_id(&json!({"name": "x"})), None);
        assert_eq!(original_id(&json!([1, 2])), None);
    }

    #[test]
    fn test_envelope_strips_id_and_stamps_metadata() {
        let doc = json!({"_id": "o-1", "total": 10, "mirroredAt": 5});
        let env = MirrorEnvelope::from_document(MutationOp::Update, &doc, 77).unwrap();

        assert_eq!(env.original_id, "o-1");
        assert_eq!(env.op, MutationOp::Update);
        assert_eq!(env.mirrored_at, 77);
        assert!(env.deleted_at.is_none());
        assert!(!env.fields.contains_key("_id"));
        assert!(!env.fields.contains_key("mirroredAt"));
        assert_eq!(env.fields["total"], 10);
    }

    #[test]
    fn test_delete_envelope_sets_deleted_at() {
        let doc = json!({"_id": "o-1"});
        let env = MirrorEnvelope::from_document(MutationOp::Delete, &doc, 99).unwrap();
        assert_eq!(env.deleted_at, Some(99));
        assert!(env.is_deleted());
    }

    #[test]
    fn test_from_document_rejects_missing_id() {
        let result = MirrorEnvelope::from_document(MutationOp::Insert, &json!({"a": 1}), 1);
        assert!(matches!(result, Err(StorageError::InvalidDocument(_))));
    }

    #[test]
    fn test_with_id_rejects_non_object_body() {
        let body = json!("just a string");
        let result = MirrorEnvelope::with_id(MutationOp::Insert, "x".into(), Some(&body), 1);
        assert!(result.is_err());
    }

    #[test]
    fn test_to_document_is_flat_camel_case() {
        let doc = json!({"_id": "i-9", "sku": "W-1"});
        let env = MirrorEnvelope::from_document(MutationOp::Insert, &doc, 5).unwrap();
        let rendered = env.to_document();

        assert_eq!(rendered["originalId"], "i-9");
        assert_eq!(rendered["op"], "insert");
        assert_eq!(rendered["mirroredAt"], 5);
        assert_eq!(rendered["sku"], "W-1");
        assert!(rendered.get("deletedAt").is_none());
    }

    #[test]
    fn test_mark_deleted_keeps_fields() {
        let doc = json!({"_id": "i-1", "qty": 3});
        let mut env = MirrorEnvelope::from_document(MutationOp::Insert, &doc, 1).unwrap();
        env.mark_deleted(50);

        assert_eq!(env.op, MutationOp::Delete);
        assert_eq!(env.deleted_at, Some(50));
        assert_eq!(env.fields["qty"], 3);
    }

    #[test]
    fn test_mutation_op_parse() {
        assert_eq!("INSERT".parse::<MutationOp>().unwrap(), MutationOp::Insert);
        assert_eq!(" delete ".parse::<MutationOp>().unwrap(), MutationOp::Delete);
        assert!("upsert".parse::<MutationOp>().is_err());
    }
}
