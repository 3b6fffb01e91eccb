//! Bounded buffer of staged mutations.
//!
//! The document store caps how many writes one atomic commit may carry.
//! [`MutationBuffer`] collects staged mutations and commits them as soon as
//! the pending count reaches `capacity - safety_margin`, so the pending
//! list never grows past that threshold. Whatever is left at the end of a
//! stream is committed by [`MutationBuffer::flush_remaining`].
//!
//! A failed commit is not retried here. The pending mutations are dropped
//! and reported back in [`PipelineError::CommitFailed`]; batches committed
//! earlier in the run stay durable.

use std::sync::Arc;

use course_harness_core::models::{FieldMap, PendingMutation, RecordRef};
use course_harness_core::store::Store;

use crate::error::PipelineError;

pub struct MutationBuffer {
    store: Arc<dyn Store>,
    threshold: usize,
    pending: Vec<PendingMutation>,
    batches_committed: u64,
    mutations_committed: u64,
}

impl MutationBuffer {
    /// `capacity` is clamped to the store's own batch limit before the
    /// safety margin is taken off.
    pub fn new(
        store: Arc<dyn Store>,
        capacity: usize,
        safety_margin: usize,
    ) -> Result<Self, PipelineError> {
        let effective = capacity.min(store.max_batch_size());
        let threshold = effective.saturating_sub(safety_margin);
        if threshold == 0 {
            return Err(PipelineError::Setup(format!(
                "batch capacity {} (store limit {}) leaves no room after safety margin {}",
                capacity,
                store.max_batch_size(),
                safety_margin
            )));
        }
        Ok(Self {
            store,
            threshold,
            pending: Vec::with_capacity(threshold),
            batches_committed: 0,
            mutations_committed: 0,
        })
    }

    /// Stage a field merge and flush if the buffer is now full.
    pub async fn stage(
        &mut self,
        reference: RecordRef,
        fields: FieldMap,
    ) -> Result<(), PipelineError> {
        self.stage_mutation(PendingMutation::merge(reference, fields))
            .await
    }

    pub async fn stage_mutation(&mut self, mutation: PendingMutation) -> Result<(), PipelineError> {
        self.pending.push(mutation);
        self.flush_if_full().await?;
        Ok(())
    }

    /// Commit when the pending count has reached the threshold.
    /// Returns whether a commit happened.
    pub async fn flush_if_full(&mut self) -> Result<bool, PipelineError> {
        if self.pending.len() >= self.threshold {
            self.flush().await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Commit whatever is still pending. Call once at the end of a stream.
    pub async fn flush_remaining(&mut self) -> Result<(), PipelineError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.flush().await
    }

    async fn flush(&mut self) -> Result<(), PipelineError> {
        let batch = std::mem::take(&mut self.pending);
        let size = batch.len();
        match self.store.commit_batch(&batch).await {
            Ok(()) => {
                self.batches_committed += 1;
                self.mutations_committed += size as u64;
                tracing::debug!(
                    size,
                    batch = self.batches_committed,
                    "committed mutation batch"
                );
                Ok(())
            }
            Err(cause) => {
                tracing::error!(size, error = %cause, "batch commit failed");
                Err(PipelineError::CommitFailed {
                    lost: batch.into_iter().map(|m| m.reference).collect(),
                    cause,
                })
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn batches_committed(&self) -> u64 {
        self.batches_committed
    }

    pub fn mutations_committed(&self) -> u64 {
        self.mutations_committed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use course_harness_core::models::{
        BackupSnapshot, BackupSummary, Collection, FieldValue, Record,
    };
    use course_harness_core::store::memory::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn seeded(children: usize) -> Arc<InMemoryStore> {
        let store = InMemoryStore::new();
        store.insert_collection("c1", FieldMap::new()).unwrap();
        for i in 0..children {
            store
                .insert_record("c1", &format!("q{:02}", i), FieldMap::new())
                .unwrap();
        }
        Arc::new(store)
    }

    fn topic(v: &str) -> FieldMap {
        let mut f = FieldMap::new();
        f.insert("topic".into(), FieldValue::Text(v.into()));
        f
    }

    #[tokio::test]
    async fn pending_never_exceeds_threshold() {
        let store = seeded(25);
        let mut buf = MutationBuffer::new(store.clone(), 15, 10).unwrap();
        assert_eq!(buf.threshold(), 5);

        for i in 0..25 {
            buf.stage(RecordRef::child("c1", format!("q{:02}", i)), topic("t"))
                .await
                .unwrap();
            assert!(buf.pending_count() < buf.threshold());
        }
        buf.flush_remaining().await.unwrap();

        assert_eq!(buf.batches_committed(), 5);
        assert_eq!(buf.mutations_committed(), 25);
        assert_eq!(store.commit_count(), 5);
    }

    #[tokio::test]
    async fn flush_remaining_commits_leftovers_once() {
        let store = seeded(7);
        let mut buf = MutationBuffer::new(store.clone(), 15, 10).unwrap();
        for i in 0..7 {
            buf.stage(RecordRef::child("c1", format!("q{:02}", i)), topic("t"))
                .await
                .unwrap();
        }
        assert_eq!(buf.pending_count(), 2);
        buf.flush_remaining().await.unwrap();
        buf.flush_remaining().await.unwrap();
        assert_eq!(store.commit_count(), 2);
        assert_eq!(buf.mutations_committed(), 7);
    }

    #[tokio::test]
    async fn threshold_clamped_to_store_limit() {
        let store = Arc::new(InMemoryStore::with_max_batch_size(12));
        let buf = MutationBuffer::new(store, 500, 10).unwrap();
        assert_eq!(buf.threshold(), 2);
    }

    #[tokio::test]
    async fn zero_threshold_is_rejected() {
        let store = Arc::new(InMemoryStore::new());
        assert!(matches!(
            MutationBuffer::new(store, 10, 10),
            Err(PipelineError::Setup(_))
        ));
    }

    /// Fails every commit after the first `ok_commits`.
    struct FlakyCommitStore {
        inner: InMemoryStore,
        ok_commits: usize,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Store for FlakyCommitStore {
        async fn list_collections(&self) -> Result<Vec<Collection>> {
            self.inner.list_collections().await
        }
        async fn list_records(&self, collection: &str) -> Result<Vec<RecordRef>> {
            self.inner.list_records(collection).await
        }
        async fn get_record(&self, reference: &RecordRef) -> Result<Option<Record>> {
            self.inner.get_record(reference).await
        }
        async fn commit_batch(&self, mutations: &[PendingMutation]) -> Result<()> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) >= self.ok_commits {
                anyhow::bail!("write quota exceeded");
            }
            self.inner.commit_batch(mutations).await
        }
        async fn put_snapshot(&self, snapshot: &BackupSnapshot) -> Result<()> {
            self.inner.put_snapshot(snapshot).await
        }
        async fn get_snapshot(&self, id: &str) -> Result<Option<BackupSnapshot>> {
            self.inner.get_snapshot(id).await
        }
        async fn list_snapshots(&self) -> Result<Vec<BackupSummary>> {
            self.inner.list_snapshots().await
        }
    }

    #[tokio::test]
    async fn failed_commit_reports_lost_mutations_and_clears() {
        let inner = InMemoryStore::new();
        inner.insert_collection("c1", FieldMap::new()).unwrap();
        for i in 0..4 {
            inner
                .insert_record("c1", &format!("q{}", i), FieldMap::new())
                .unwrap();
        }
        let store = Arc::new(FlakyCommitStore {
            inner,
            ok_commits: 1,
            attempts: AtomicUsize::new(0),
        });
        let mut buf = MutationBuffer::new(store.clone(), 12, 10).unwrap();

        buf.stage(RecordRef::child("c1", "q0"), topic("a")).await.unwrap();
        buf.stage(RecordRef::child("c1", "q1"), topic("a")).await.unwrap();
        buf.stage(RecordRef::child("c1", "q2"), topic("a")).await.unwrap();
        let err = buf
            .stage(RecordRef::child("c1", "q3"), topic("a"))
            .await
            .unwrap_err();

        match err {
            PipelineError::CommitFailed { lost, .. } => assert_eq!(
                lost,
                vec![RecordRef::child("c1", "q2"), RecordRef::child("c1", "q3")]
            ),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(buf.pending_count(), 0);
        assert_eq!(buf.mutations_committed(), 2);

        let q0 = store
            .get_record(&RecordRef::child("c1", "q0"))
            .await
            .unwrap()
            .unwrap();
        assert!(q0.has("topic"));
        let q2 = store
            .get_record(&RecordRef::child("c1", "q2"))
            .await
            .unwrap()
            .unwrap();
        assert!(!q2.has("topic"));
    }
}
