//! Bulk import of courses and questions from a JSON file.
//!
//! ```json
//! { "collections": [
//!     { "id": "rust-101", "fields": { "title": "Intro to Rust" },
//!       "records": [ { "id": "q1", "fields": { "question": "...", "options": ["a", "b"], "correctAnswer": 0 } } ] }
//! ] }
//! ```
//!
//! Plain JSON field values are converted with [`FieldValue::from_json`].
//! Everything is written with `Replace` mutations through the
//! [`MutationBuffer`], so importing the same file twice is harmless.
//!
//! [`FieldValue::from_json`]: course_harness_core::models::FieldValue::from_json

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;

use course_harness_core::models::{field_map_from_json, PendingMutation, RecordRef};
use course_harness_core::store::Store;

use crate::batch::MutationBuffer;
use crate::config::Config;

#[derive(Debug, Deserialize)]
pub struct ImportFile {
    pub collections: Vec<ImportCollection>,
}

#[derive(Debug, Deserialize)]
pub struct ImportCollection {
    pub id: String,
    #[serde(default)]
    pub fields: serde_json::Value,
    #[serde(default)]
    pub records: Vec<ImportRecord>,
}

#[derive(Debug, Deserialize)]
pub struct ImportRecord {
    pub id: String,
    #[serde(default)]
    pub fields: serde_json::Value,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportStats {
    pub collections: u64,
    pub records: u64,
    pub batches: u64,
}

pub fn parse_import(text: &str) -> Result<ImportFile> {
    let file: ImportFile = serde_json::from_str(text).context("invalid import file")?;
    for c in &file.collections {
        if c.id.trim().is_empty() {
            anyhow::bail!("collection with empty id in import file");
        }
        if let Some(r) = c.records.iter().find(|r| r.id.trim().is_empty()) {
            anyhow::bail!("record with empty id {:?} in collection {}", r.id, c.id);
        }
    }
    Ok(file)
}

/// Write every collection and record of `file` into `store`.
pub async fn import_into(
    store: Arc<dyn Store>,
    config: &Config,
    file: ImportFile,
) -> Result<ImportStats> {
    let mut buffer = MutationBuffer::new(store, config.batch.capacity, config.batch.safety_margin)?;
    let mut stats = ImportStats::default();

    for c in file.collections {
        buffer
            .stage_mutation(PendingMutation::replace(
                RecordRef::collection(c.id.clone()),
                field_map_from_json(c.fields),
            ))
            .await?;
        stats.collections += 1;

        for r in c.records {
            buffer
                .stage_mutation(PendingMutation::replace(
                    RecordRef::child(c.id.clone(), r.id),
                    field_map_from_json(r.fields),
                ))
                .await?;
            stats.records += 1;
        }
    }
    buffer.flush_remaining().await?;
    stats.batches = buffer.batches_committed();

    Ok(stats)
}

/// CLI entry point: read `path` and import it into the configured store.
pub async fn run_import(config: &Config, store: Arc<dyn Store>, path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read import file: {}", path.display()))?;
    let file = parse_import(&text)?;
    let stats = import_into(store, config, file).await?;

    println!("import {}", path.display());
    println!("  collections: {}", stats.collections);
    println!("  records: {}", stats.records);
    println!("  batches committed: {}", stats.batches);
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use course_harness_core::models::FieldValue;
    use course_harness_core::store::memory::InMemoryStore;

    const SAMPLE: &str = r#"{
        "collections": [
            { "id": "rust", "fields": { "title": "Rust" },
              "records": [
                { "id": "q1", "fields": { "question": "Q?", "options": ["a", "b"], "correctAnswer": 1 } },
                { "id": "q2" }
              ] },
            { "id": "art" }
        ]
    }"#;

    #[tokio::test]
    async fn imports_both_levels_with_typed_fields() {
        let store = Arc::new(InMemoryStore::new());
        let file = parse_import(SAMPLE).unwrap();
        let stats = import_into(store.clone(), &Config::minimal(), file)
            .await
            .unwrap();
        assert_eq!(stats.collections, 2);
        assert_eq!(stats.records, 2);
        assert_eq!(store.record_count().unwrap(), 4);

        let q1 = store
            .get_record(&RecordRef::child("rust", "q1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(q1.get("correctAnswer"), Some(&FieldValue::Integer(1)));
        assert_eq!(q1.text_list("options").map(|o| o.len()), Some(2));
    }

    #[test]
    fn rejects_blank_ids() {
        assert!(parse_import(r#"{"collections": [{"id": " "}]}"#).is_err());
        assert!(parse_import(r#"{"collections": [{"id": "c", "records": [{"id": ""}]}]}"#).is_err());
    }
}
