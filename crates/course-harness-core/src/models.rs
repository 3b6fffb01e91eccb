//! Core data models shared by every part of Course Harness.
//!
//! The document store behind the education application is schemaless, so
//! records arrive as loose bags of fields. Here every field value is one
//! variant of the tagged [`FieldValue`] union, with an explicit
//! [`FieldValue::Legacy`] bucket for shapes the pipeline does not know
//! about. Typed access goes through [`Record`] helpers; structural checks
//! live in [`crate::validate`].

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Well-known field names read or written by the pipeline.
pub mod fields {
    pub const TITLE: &str = "title";
    pub const DESCRIPTION: &str = "description";
    pub const CATEGORY: &str = "category";
    pub const QUESTION: &str = "question";
    pub const OPTIONS: &str = "options";
    pub const CORRECT_ANSWER: &str = "correctAnswer";
    pub const EXPLANATION: &str = "explanation";
    pub const DIFFICULTY: &str = "difficulty";
    pub const TAGS: &str = "tags";
    pub const TOPIC: &str = "topic";
    pub const ENRICHED_BY: &str = "enrichedBy";
    pub const ENRICHMENT_VERSION: &str = "enrichmentVersion";
    pub const ENRICHED_AT: &str = "enrichedAt";
    pub const MIGRATION_VERSION: &str = "migrationVersion";
    pub const MIGRATED_BY: &str = "migratedBy";
}

/// A single typed field value.
///
/// Serialized as `{"type": "...", "value": ...}` so snapshots and the
/// SQLite store round-trip without losing the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    TextList(Vec<String>),
    Timestamp(DateTime<Utc>),
    /// Anything the pipeline has no typed variant for. Carried through
    /// untouched so rewrites never drop data.
    Legacy(serde_json::Value),
}

impl FieldValue {
    /// Convert a plain JSON value (as found in imports) into a typed field.
    pub fn from_json(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::String(s) => FieldValue::Text(s),
            Value::Bool(b) => FieldValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => FieldValue::Integer(i),
                None => match n.as_f64() {
                    Some(f) => FieldValue::Float(f),
                    None => FieldValue::Legacy(Value::Number(n)),
                },
            },
            Value::Array(items) if items.iter().all(|v| v.is_string()) => FieldValue::TextList(
                items
                    .into_iter()
                    .filter_map(|v| match v {
                        Value::String(s) => Some(s),
                        _ => None,
                    })
                    .collect(),
            ),
            other => FieldValue::Legacy(other),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(i) => Some(*i),
            FieldValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_text_list(&self) -> Option<&[String]> {
        match self {
            FieldValue::TextList(items) => Some(items),
            _ => None,
        }
    }

    /// True for values that carry no information (null, blank text).
    pub fn is_blank(&self) -> bool {
        match self {
            FieldValue::Text(s) => s.trim().is_empty(),
            FieldValue::Legacy(serde_json::Value::Null) => true,
            _ => false,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::Integer(i)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(items: Vec<String>) -> Self {
        FieldValue::TextList(items)
    }
}

/// Ordered field map. Ordering keeps snapshots and checksums stable.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// Build a [`FieldMap`] from a plain JSON object. Non-objects yield an empty map.
pub fn field_map_from_json(value: serde_json::Value) -> FieldMap {
    match value {
        serde_json::Value::Object(obj) => obj
            .into_iter()
            .map(|(k, v)| (k, FieldValue::from_json(v)))
            .collect(),
        _ => FieldMap::new(),
    }
}

/// Address of a record in the two-level hierarchy.
///
/// A collection (e.g. a course) is itself a record; its subcollection
/// holds child records (e.g. the course's questions).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordRef {
    Collection { id: String },
    Child { collection: String, id: String },
}

impl RecordRef {
    pub fn collection(id: impl Into<String>) -> Self {
        RecordRef::Collection { id: id.into() }
    }

    pub fn child(collection: impl Into<String>, id: impl Into<String>) -> Self {
        RecordRef::Child {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// The owning collection id (the record's own id for collections).
    pub fn collection_id(&self) -> &str {
        match self {
            RecordRef::Collection { id } => id,
            RecordRef::Child { collection, .. } => collection,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            RecordRef::Collection { id } => id,
            RecordRef::Child { id, .. } => id,
        }
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordRef::Collection { id } => write!(f, "{}", id),
            RecordRef::Child { collection, id } => write!(f, "{}/{}", collection, id),
        }
    }
}

/// Which level of the hierarchy an operation walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetLevel {
    /// The top-level collection records themselves.
    Collections,
    /// The child records of every collection's subcollection.
    Records,
}

/// A top-level collection record (e.g. a course).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    #[serde(default)]
    pub fields: FieldMap,
}

impl Collection {
    pub fn new(id: impl Into<String>, fields: FieldMap) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    pub fn reference(&self) -> RecordRef {
        RecordRef::collection(self.id.clone())
    }

    pub fn to_record(&self) -> Record {
        Record::new(self.reference(), self.fields.clone())
    }
}

/// A uniquely addressed bag of typed fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub reference: RecordRef,
    #[serde(default)]
    pub fields: FieldMap,
}

impl Record {
    pub fn new(reference: RecordRef, fields: FieldMap) -> Self {
        Self { reference, fields }
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Non-blank text value of a field.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(FieldValue::as_text)
            .filter(|s| !s.trim().is_empty())
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(FieldValue::as_integer)
    }

    pub fn text_list(&self, name: &str) -> Option<&[String]> {
        self.get(name).and_then(FieldValue::as_text_list)
    }

    /// Present and not blank.
    pub fn has(&self, name: &str) -> bool {
        self.get(name).map(|v| !v.is_blank()).unwrap_or(false)
    }
}

/// How a staged mutation is applied at commit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Overlay the given fields onto an existing record.
    Merge,
    /// Overwrite the whole field set, creating the record if absent.
    Replace,
}

/// A field update staged against a record but not yet committed.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
    pub reference: RecordRef,
    pub fields: FieldMap,
    pub mode: WriteMode,
}

impl PendingMutation {
    pub fn merge(reference: RecordRef, fields: FieldMap) -> Self {
        Self {
            reference,
            fields,
            mode: WriteMode::Merge,
        }
    }

    pub fn replace(reference: RecordRef, fields: FieldMap) -> Self {
        Self {
            reference,
            fields,
            mode: WriteMode::Replace,
        }
    }
}

/// One collection and its subcollection, as captured in a backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSnapshot {
    pub collection: Collection,
    pub records: Vec<Record>,
}

/// Immutable point-in-time copy of the scoped data set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSnapshot {
    pub id: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
    /// Collection id the backup was limited to, if any.
    pub scope: Option<String>,
    /// Every serialized record: collections plus their children.
    pub record_count: usize,
    /// SHA-256 of the serialized `collections` payload.
    pub checksum: String,
    pub collections: Vec<CollectionSnapshot>,
}

impl BackupSnapshot {
    pub fn new(
        label: impl Into<String>,
        scope: Option<String>,
        collections: Vec<CollectionSnapshot>,
    ) -> Result<Self> {
        let checksum = Self::checksum_of(&collections)?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            label: label.into(),
            created_at: Utc::now(),
            scope,
            record_count: Self::count_records(&collections),
            checksum,
            collections,
        })
    }

    pub fn count_records(collections: &[CollectionSnapshot]) -> usize {
        collections.iter().map(|c| 1 + c.records.len()).sum()
    }

    pub fn checksum_of(collections: &[CollectionSnapshot]) -> Result<String> {
        let bytes = serde_json::to_vec(collections)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(format!("{:x}", hasher.finalize()))
    }

    pub fn summary(&self) -> BackupSummary {
        BackupSummary {
            id: self.id.clone(),
            label: self.label.clone(),
            created_at: self.created_at,
            scope: self.scope.clone(),
            record_count: self.record_count,
            checksum: self.checksum.clone(),
        }
    }
}

/// Listing view of a backup, without its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSummary {
    pub id: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub scope: Option<String>,
    pub record_count: usize,
    pub checksum: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_json_picks_typed_variants() {
        assert_eq!(FieldValue::from_json(json!("x")), FieldValue::Text("x".into()));
        assert_eq!(FieldValue::from_json(json!(3)), FieldValue::Integer(3));
        assert_eq!(FieldValue::from_json(json!(1.5)), FieldValue::Float(1.5));
        assert_eq!(
            FieldValue::from_json(json!(["a", "b"])),
            FieldValue::TextList(vec!["a".into(), "b".into()])
        );
        assert_eq!(
            FieldValue::from_json(json!({"nested": 1})),
            FieldValue::Legacy(json!({"nested": 1}))
        );
        assert_eq!(
            FieldValue::from_json(json!([1, "mixed"])),
            FieldValue::Legacy(json!([1, "mixed"]))
        );
    }

    #[test]
    fn tagged_serialization_keeps_variant() {
        let v = FieldValue::Integer(2);
        let s = serde_json::to_string(&v).unwrap();
        assert_eq!(s, r#"{"type":"integer","value":2}"#);
        let back: FieldValue = serde_json::from_str(&s).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn record_text_ignores_blank() {
        let mut fields = FieldMap::new();
        fields.insert("question".into(), FieldValue::Text("   ".into()));
        let r = Record::new(RecordRef::child("c1", "q1"), fields);
        assert_eq!(r.text("question"), None);
        assert!(!r.has("question"));
    }

    #[test]
    fn record_ref_display() {
        assert_eq!(RecordRef::collection("rust-101").to_string(), "rust-101");
        assert_eq!(RecordRef::child("rust-101", "q7").to_string(), "rust-101/q7");
    }

    #[test]
    fn snapshot_counts_collections_and_children() {
        let snap = BackupSnapshot::new(
            "pre",
            None,
            vec![CollectionSnapshot {
                collection: Collection::new("c1", FieldMap::new()),
                records: vec![
                    Record::new(RecordRef::child("c1", "a"), FieldMap::new()),
                    Record::new(RecordRef::child("c1", "b"), FieldMap::new()),
                ],
            }],
        )
        .unwrap();
        assert_eq!(snap.record_count, 3);
        assert_eq!(
            snap.checksum,
            BackupSnapshot::checksum_of(&snap.collections).unwrap()
        );
    }
}
