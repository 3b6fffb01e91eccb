//! Point-in-time backups of the course hierarchy.
//!
//! A backup walks the scoped collections and their children read-only,
//! serializes every record into a [`BackupSnapshot`] and hands it to
//! [`Store::put_snapshot`]. Snapshots are immutable: restore never edits
//! them, it only writes their contents back.
//!
//! Restore is a verified rollback. The checksum and record count are
//! recomputed first; then every snapshotted record is written back with a
//! `Replace` mutation through the [`MutationBuffer`], so large restores
//! respect the store's batch limit. Records created after the snapshot are
//! left alone because the pipeline never deletes.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Serialize;

use course_harness_core::models::{
    BackupSnapshot, BackupSummary, CollectionSnapshot, PendingMutation, RecordRef,
};
use course_harness_core::progress::ProgressState;
use course_harness_core::store::Store;

use crate::batch::MutationBuffer;
use crate::error::PipelineError;
use crate::progress::ProgressReporter;

/// Outcome of [`BackupManager::restore_backup`].
#[derive(Debug, Clone, Serialize)]
pub struct RestoreSummary {
    pub backup_id: String,
    pub restored: u64,
    pub batches_committed: u64,
    /// Records whose write-back was lost to a failed commit.
    pub lost: Vec<RecordRef>,
}

impl RestoreSummary {
    pub fn is_complete(&self) -> bool {
        self.lost.is_empty()
    }
}

pub struct BackupManager {
    store: Arc<dyn Store>,
    batch_capacity: usize,
    safety_margin: usize,
}

impl BackupManager {
    pub fn new(store: Arc<dyn Store>, batch_capacity: usize, safety_margin: usize) -> Self {
        Self {
            store,
            batch_capacity,
            safety_margin,
        }
    }

    /// Snapshot every collection, or only `scope`, and persist it.
    pub async fn create_backup(&self, label: &str, scope: Option<&str>) -> Result<BackupSnapshot> {
        let mut collections = self
            .store
            .list_collections()
            .await
            .context("listing collections for backup")?;
        if let Some(id) = scope {
            collections.retain(|c| c.id == id);
            if collections.is_empty() {
                bail!("collection not found: {}", id);
            }
        }

        let mut captured = Vec::with_capacity(collections.len());
        for collection in collections {
            let refs = self
                .store
                .list_records(&collection.id)
                .await
                .with_context(|| format!("listing records of {}", collection.id))?;
            let mut records = Vec::with_capacity(refs.len());
            for reference in refs {
                // A child that vanished between listing and reading is simply not captured.
                if let Some(record) = self.store.get_record(&reference).await? {
                    records.push(record);
                }
            }
            captured.push(CollectionSnapshot {
                collection,
                records,
            });
        }

        let snapshot = BackupSnapshot::new(label, scope.map(str::to_string), captured)?;
        self.store
            .put_snapshot(&snapshot)
            .await
            .context("persisting backup snapshot")?;

        tracing::info!(
            backup_id = %snapshot.id,
            label = %snapshot.label,
            records = snapshot.record_count,
            "backup created"
        );
        Ok(snapshot)
    }

    pub async fn list_backups(&self) -> Result<Vec<BackupSummary>> {
        self.store.list_snapshots().await
    }

    pub async fn load_backup(&self, id: &str) -> Result<BackupSnapshot> {
        match self.store.get_snapshot(id).await? {
            Some(snapshot) => Ok(snapshot),
            None => bail!("backup not found: {}", id),
        }
    }

    /// Recompute checksum and record count.
    pub fn verify(snapshot: &BackupSnapshot) -> Result<()> {
        let checksum = BackupSnapshot::checksum_of(&snapshot.collections)?;
        if checksum != snapshot.checksum {
            bail!(
                "backup {} checksum mismatch: stored {}, computed {}",
                snapshot.id,
                snapshot.checksum,
                checksum
            );
        }
        let count = BackupSnapshot::count_records(&snapshot.collections);
        if count != snapshot.record_count {
            bail!(
                "backup {} record count mismatch: stored {}, computed {}",
                snapshot.id,
                snapshot.record_count,
                count
            );
        }
        Ok(())
    }

    /// Write every record of backup `id` back to the store.
    pub async fn restore_backup(
        &self,
        id: &str,
        reporter: &dyn ProgressReporter,
    ) -> Result<RestoreSummary, PipelineError> {
        let snapshot = self.load_backup(id).await.map_err(PipelineError::Backup)?;
        Self::verify(&snapshot).map_err(PipelineError::Backup)?;

        let mut buffer =
            MutationBuffer::new(self.store.clone(), self.batch_capacity, self.safety_margin)?;
        let mut progress = ProgressState::new(snapshot.record_count as u64);
        progress.current_label = format!("restore {}", snapshot.id);

        let mut lost = Vec::new();
        'outer: for entry in &snapshot.collections {
            let mut mutations = Vec::with_capacity(1 + entry.records.len());
            mutations.push(PendingMutation::replace(
                entry.collection.reference(),
                entry.collection.fields.clone(),
            ));
            mutations.extend(
                entry
                    .records
                    .iter()
                    .map(|r| PendingMutation::replace(r.reference.clone(), r.fields.clone())),
            );

            for mutation in mutations {
                progress.processed_count += 1;
                progress.success_count += 1;
                if let Err(e) = buffer.stage_mutation(mutation).await {
                    collect_lost(e, &mut lost, &mut progress)?;
                    break 'outer;
                }
            }
            reporter.report(&progress);
        }

        if lost.is_empty() {
            if let Err(e) = buffer.flush_remaining().await {
                collect_lost(e, &mut lost, &mut progress)?;
            }
        }
        progress.current_label = format!("restore {} done", snapshot.id);
        reporter.report(&progress);

        let summary = RestoreSummary {
            backup_id: snapshot.id.clone(),
            restored: buffer.mutations_committed(),
            batches_committed: buffer.batches_committed(),
            lost,
        };
        tracing::info!(
            backup_id = %summary.backup_id,
            restored = summary.restored,
            lost = summary.lost.len(),
            "restore finished"
        );
        Ok(summary)
    }

    /// Write backup `id` as pretty JSON to `output`, or stdout when `None`.
    pub async fn export_backup(&self, id: &str, output: Option<&Path>) -> Result<usize> {
        let snapshot = self.load_backup(id).await?;
        let json = serde_json::to_string_pretty(&snapshot)?;

        match output {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, &json)
                    .with_context(|| format!("writing {}", path.display()))?;
                eprintln!(
                    "Exported backup {} ({} records) to {}",
                    snapshot.id,
                    snapshot.record_count,
                    path.display()
                );
            }
            None => {
                println!("{}", json);
            }
        }

        Ok(snapshot.record_count)
    }
}

/// Records lost to a failed commit were counted as successes when staged;
/// move them over to the failure count.
fn collect_lost(
    e: PipelineError,
    lost: &mut Vec<RecordRef>,
    progress: &mut ProgressState,
) -> Result<(), PipelineError> {
    match e {
        PipelineError::CommitFailed { lost: refs, cause } => {
            tracing::error!(lost = refs.len(), error = %cause, "restore commit failed");
            let n = refs.len() as u64;
            progress.success_count = progress.success_count.saturating_sub(n);
            progress.failure_count += n;
            lost.extend(refs);
            Ok(())
        }
        other => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use course_harness_core::models::{FieldMap, FieldValue};
    use course_harness_core::store::memory::InMemoryStore;

    fn title(t: &str) -> FieldMap {
        let mut f = FieldMap::new();
        f.insert("title".into(), FieldValue::Text(t.into()));
        f
    }

    fn seeded() -> Arc<InMemoryStore> {
        let store = InMemoryStore::new();
        store.insert_collection("rust", title("Rust")).unwrap();
        store.insert_collection("art", title("Art")).unwrap();
        for i in 0..3 {
            store
                .insert_record("rust", &format!("q{}", i), title("q"))
                .unwrap();
        }
        Arc::new(store)
    }

    #[tokio::test]
    async fn scoped_backup_counts_collection_and_children() {
        let store = seeded();
        let mgr = BackupManager::new(store.clone(), 500, 10);
        let snap = mgr.create_backup("pre", Some("rust")).await.unwrap();
        assert_eq!(snap.record_count, 4);
        assert_eq!(snap.scope.as_deref(), Some("rust"));
        BackupManager::verify(&snap).unwrap();

        let listed = mgr.list_backups().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, snap.id);
    }

    #[tokio::test]
    async fn unknown_scope_is_an_error() {
        let mgr = BackupManager::new(seeded(), 500, 10);
        assert!(mgr.create_backup("pre", Some("nope")).await.is_err());
    }

    #[tokio::test]
    async fn tampered_snapshot_fails_verification() {
        let mgr = BackupManager::new(seeded(), 500, 10);
        let mut snap = mgr.create_backup("pre", None).await.unwrap();
        snap.collections[0].records.clear();
        assert!(BackupManager::verify(&snap).is_err());
    }

    #[tokio::test]
    async fn restore_rewrites_fields_in_small_batches() {
        let store = seeded();
        let mgr = BackupManager::new(store.clone(), 12, 10);
        let snap = mgr.create_backup("pre", None).await.unwrap();

        let mut changed = title("Changed");
        changed.insert("category".into(), FieldValue::Text("programming".into()));
        store
            .commit_batch(&[PendingMutation::replace(RecordRef::collection("rust"), changed)])
            .await
            .unwrap();

        let summary = mgr.restore_backup(&snap.id, &NoProgress).await.unwrap();
        assert!(summary.is_complete());
        assert_eq!(summary.restored, 5);
        assert_eq!(summary.batches_committed, 3);

        let rust = store
            .get_record(&RecordRef::collection("rust"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rust.text("title"), Some("Rust"));
        assert!(!rust.has("category"));
    }

    #[tokio::test]
    async fn restore_of_missing_backup_is_a_backup_error() {
        let mgr = BackupManager::new(seeded(), 500, 10);
        assert!(matches!(
            mgr.restore_backup("missing", &NoProgress).await,
            Err(PipelineError::Backup(_))
        ));
    }

    #[tokio::test]
    async fn export_writes_json_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let mgr = BackupManager::new(seeded(), 500, 10);
        let snap = mgr.create_backup("pre", None).await.unwrap();
        let out = dir.path().join("backups").join("pre.json");

        let count = mgr.export_backup(&snap.id, Some(&out)).await.unwrap();
        assert_eq!(count, 5);
        let parsed: BackupSnapshot =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(parsed, snap);
    }
}
