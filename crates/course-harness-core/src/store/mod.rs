//! Storage abstraction for Course Harness.
//!
//! The [`Store`] trait is the narrow slice of the document store the
//! pipeline needs: enumerate the two-level hierarchy, read single records,
//! commit bounded batches atomically, and keep backup snapshots.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::models::{
    BackupSnapshot, BackupSummary, Collection, FieldMap, PendingMutation, RecordRef, Record,
    WriteMode,
};

/// Largest batch most document stores accept in one atomic commit.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 500;

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`list_collections`](Store::list_collections) | Every top-level collection record |
/// | [`list_records`](Store::list_records) | References to one collection's children |
/// | [`get_record`](Store::get_record) | A single record at either level |
/// | [`commit_batch`](Store::commit_batch) | Atomic, capacity-bounded write |
/// | [`put_snapshot`](Store::put_snapshot) | Persist a new backup |
/// | [`get_snapshot`](Store::get_snapshot) | Load a backup by id |
/// | [`list_snapshots`](Store::list_snapshots) | Backup summaries, newest first |
#[async_trait]
pub trait Store: Send + Sync {
    async fn list_collections(&self) -> Result<Vec<Collection>>;

    /// Child records of `collection`, in a stable order.
    async fn list_records(&self, collection: &str) -> Result<Vec<RecordRef>>;

    async fn get_record(&self, reference: &RecordRef) -> Result<Option<Record>>;

    /// Apply every mutation or none of them.
    ///
    /// Must reject batches larger than [`max_batch_size`](Store::max_batch_size).
    async fn commit_batch(&self, mutations: &[PendingMutation]) -> Result<()>;

    /// Maximum number of mutations accepted by one [`commit_batch`](Store::commit_batch).
    fn max_batch_size(&self) -> usize {
        DEFAULT_MAX_BATCH_SIZE
    }

    /// Persist a backup. Snapshots are write-once; reusing an id is an error.
    async fn put_snapshot(&self, snapshot: &BackupSnapshot) -> Result<()>;

    async fn get_snapshot(&self, id: &str) -> Result<Option<BackupSnapshot>>;

    async fn list_snapshots(&self) -> Result<Vec<BackupSummary>>;
}

/// Compute the field set a mutation leaves behind.
///
/// `Merge` overlays onto `existing` and fails when the record is absent;
/// `Replace` ignores `existing` entirely.
pub fn apply_mutation(existing: Option<&FieldMap>, mutation: &PendingMutation) -> Result<FieldMap> {
    match mutation.mode {
        WriteMode::Replace => Ok(mutation.fields.clone()),
        WriteMode::Merge => {
            let Some(existing) = existing else {
                bail!("record not found: {}", mutation.reference);
            };
            let mut merged = existing.clone();
            for (k, v) in &mutation.fields {
                merged.insert(k.clone(), v.clone());
            }
            Ok(merged)
        }
    }
}

/// Reject batches over the store's limit.
pub fn check_batch_size(mutations: &[PendingMutation], max: usize) -> Result<()> {
    if mutations.len() > max {
        bail!(
            "batch of {} mutations exceeds the store limit of {}",
            mutations.len(),
            max
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FieldValue;

    #[test]
    fn merge_overlays_fields() {
        let mut existing = FieldMap::new();
        existing.insert("a".into(), FieldValue::Integer(1));
        existing.insert("b".into(), FieldValue::Integer(2));
        let mut update = FieldMap::new();
        update.insert("b".into(), FieldValue::Integer(20));
        update.insert("c".into(), FieldValue::Integer(30));

        let m = PendingMutation::merge(RecordRef::collection("x"), update);
        let out = apply_mutation(Some(&existing), &m).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out["b"], FieldValue::Integer(20));
    }

    #[test]
    fn merge_requires_existing_record() {
        let m = PendingMutation::merge(RecordRef::collection("x"), FieldMap::new());
        assert!(apply_mutation(None, &m).is_err());
    }

    #[test]
    fn replace_drops_old_fields() {
        let mut existing = FieldMap::new();
        existing.insert("old".into(), FieldValue::Bool(true));
        let m = PendingMutation::replace(RecordRef::collection("x"), FieldMap::new());
        assert!(apply_mutation(Some(&existing), &m).unwrap().is_empty());
    }
}
