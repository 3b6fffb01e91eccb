//! In-memory [`Store`] implementation for tests and embedding.
//!
//! Uses `BTreeMap` behind `std::sync::RwLock`. A commit builds the next
//! state on a copy and swaps it in only when every mutation applied, which
//! gives the same all-or-nothing behavior as a transactional backend.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::models::{
    BackupSnapshot, BackupSummary, Collection, FieldMap, PendingMutation, Record, RecordRef,
};

use super::{apply_mutation, check_batch_size, Store, DEFAULT_MAX_BATCH_SIZE};

#[derive(Clone, Default)]
struct StoredCollection {
    fields: FieldMap,
    children: BTreeMap<String, FieldMap>,
}

type Tree = BTreeMap<String, StoredCollection>;

/// In-memory store.
pub struct InMemoryStore {
    tree: RwLock<Tree>,
    snapshots: RwLock<Vec<BackupSnapshot>>,
    max_batch_size: usize,
    commits: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_max_batch_size(DEFAULT_MAX_BATCH_SIZE)
    }

    pub fn with_max_batch_size(max_batch_size: usize) -> Self {
        Self {
            tree: RwLock::new(BTreeMap::new()),
            snapshots: RwLock::new(Vec::new()),
            max_batch_size,
            commits: AtomicUsize::new(0),
        }
    }

    /// Seed a collection record, replacing any existing fields.
    pub fn insert_collection(&self, id: &str, fields: FieldMap) -> Result<()> {
        let mut tree = self.tree.write().map_err(|_| poisoned())?;
        tree.entry(id.to_string()).or_default().fields = fields;
        Ok(())
    }

    /// Seed a child record under an existing collection.
    pub fn insert_record(&self, collection: &str, id: &str, fields: FieldMap) -> Result<()> {
        let mut tree = self.tree.write().map_err(|_| poisoned())?;
        let Some(parent) = tree.get_mut(collection) else {
            bail!("collection not found: {}", collection);
        };
        parent.children.insert(id.to_string(), fields);
        Ok(())
    }

    /// Number of successful [`Store::commit_batch`] calls.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Total records across both levels.
    pub fn record_count(&self) -> Result<usize> {
        let tree = self.tree.read().map_err(|_| poisoned())?;
        Ok(tree.values().map(|c| 1 + c.children.len()).sum())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> anyhow::Error {
    anyhow!("in-memory store lock poisoned")
}

fn apply_to_tree(tree: &mut Tree, mutation: &PendingMutation) -> Result<()> {
    match &mutation.reference {
        RecordRef::Collection { id } => {
            let existing = tree.get(id).map(|c| &c.fields);
            let next = apply_mutation(existing, mutation)?;
            tree.entry(id.clone()).or_default().fields = next;
        }
        RecordRef::Child { collection, id } => {
            let Some(parent) = tree.get_mut(collection) else {
                bail!("collection not found: {}", collection);
            };
            let next = apply_mutation(parent.children.get(id), mutation)?;
            parent.children.insert(id.clone(), next);
        }
    }
    Ok(())
}

#[async_trait]
impl Store for InMemoryStore {
    async fn list_collections(&self) -> Result<Vec<Collection>> {
        let tree = self.tree.read().map_err(|_| poisoned())?;
        Ok(tree
            .iter()
            .map(|(id, c)| Collection::new(id.clone(), c.fields.clone()))
            .collect())
    }

    async fn list_records(&self, collection: &str) -> Result<Vec<RecordRef>> {
        let tree = self.tree.read().map_err(|_| poisoned())?;
        Ok(tree
            .get(collection)
            .map(|c| {
                c.children
                    .keys()
                    .map(|id| RecordRef::child(collection, id.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_record(&self, reference: &RecordRef) -> Result<Option<Record>> {
        let tree = self.tree.read().map_err(|_| poisoned())?;
        let fields = match reference {
            RecordRef::Collection { id } => tree.get(id).map(|c| c.fields.clone()),
            RecordRef::Child { collection, id } => tree
                .get(collection)
                .and_then(|c| c.children.get(id))
                .cloned(),
        };
        Ok(fields.map(|f| Record::new(reference.clone(), f)))
    }

    async fn commit_batch(&self, mutations: &[PendingMutation]) -> Result<()> {
        check_batch_size(mutations, self.max_batch_size)?;
        let mut tree = self.tree.write().map_err(|_| poisoned())?;
        let mut next = tree.clone();
        for m in mutations {
            apply_to_tree(&mut next, m)?;
        }
        *tree = next;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    async fn put_snapshot(&self, snapshot: &BackupSnapshot) -> Result<()> {
        let mut snaps = self.snapshots.write().map_err(|_| poisoned())?;
        if snaps.iter().any(|s| s.id == snapshot.id) {
            bail!("snapshot already exists: {}", snapshot.id);
        }
        snaps.push(snapshot.clone());
        Ok(())
    }

    async fn get_snapshot(&self, id: &str) -> Result<Option<BackupSnapshot>> {
        let snaps = self.snapshots.read().map_err(|_| poisoned())?;
        Ok(snaps.iter().find(|s| s.id == id).cloned())
    }

    async fn list_snapshots(&self) -> Result<Vec<BackupSummary>> {
        let snaps = self.snapshots.read().map_err(|_| poisoned())?;
        let mut out: Vec<BackupSummary> = snaps.iter().map(BackupSnapshot::summary).collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }
}
