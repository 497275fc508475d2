//! Shared test doubles for engine integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use mend_engine::{
    BulkResult, ConflictScanner, EntityKind, IdAndRev, InMemoryStore, ItemFailure, Record,
    ReplicaWriter, Result, Revision, VersionedStore,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Wraps an [`InMemoryStore`], recording writes and injecting faults.
#[derive(Default)]
pub struct RecordingStore {
    pub inner: InMemoryStore,
    saves: Mutex<Vec<Record>>,
    bulk_calls: AtomicUsize,
    purges: Mutex<Vec<IdAndRev>>,
    /// Revision reported by the next `save`, instead of the real one
    forced_save_rev: Mutex<Option<Revision>>,
    /// 1-based bulk call whose items all fail
    failing_bulk_call: Mutex<Option<usize>>,
    /// 1-based bulk call whose last item fails
    partially_failing_bulk_call: Mutex<Option<usize>>,
    /// Every purged item fails
    failing_purges: Mutex<bool>,
    /// Revisions `get_at_revision` pretends are gone
    hidden_revisions: Mutex<Vec<Revision>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saves(&self) -> Vec<Record> {
        self.saves.lock().unwrap().clone()
    }

    pub fn purged(&self) -> Vec<IdAndRev> {
        self.purges.lock().unwrap().clone()
    }

    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    /// Number of write calls of any kind.
    pub fn write_calls(&self) -> usize {
        self.saves.lock().unwrap().len() + self.bulk_calls() + self.purges.lock().unwrap().len()
    }

    pub fn force_next_save_rev(&self, rev: impl Into<Revision>) {
        *self.forced_save_rev.lock().unwrap() = Some(rev.into());
    }

    pub fn fail_bulk_call(&self, call: usize) {
        *self.failing_bulk_call.lock().unwrap() = Some(call);
    }

    pub fn fail_last_item_of_bulk_call(&self, call: usize) {
        *self.partially_failing_bulk_call.lock().unwrap() = Some(call);
    }

    pub fn hide_revision(&self, rev: impl Into<Revision>) {
        self.hidden_revisions.lock().unwrap().push(rev.into());
    }

    pub fn fail_purges(&self) {
        *self.failing_purges.lock().unwrap() = true;
    }

    pub async fn replicate(&self, records: Vec<Record>) {
        let results = self.inner.write_replicas(records).await.unwrap();
        assert!(results.iter().all(|r| r.is_ok()));
    }
}

#[async_trait]
impl VersionedStore for RecordingStore {
    async fn get(&self, id: &str) -> Result<Option<Record>> {
        self.inner.get(id).await
    }

    async fn get_with_conflicts(&self, id: &str) -> Result<Option<Record>> {
        self.inner.get_with_conflicts(id).await
    }

    async fn get_at_revision(&self, id: &str, rev: &str) -> Result<Option<Record>> {
        let hidden = self.hidden_revisions.lock().unwrap().iter().any(|r| r == rev);
        if hidden {
            return Ok(None);
        }
        self.inner.get_at_revision(id, rev).await
    }

    async fn save(&self, record: Record) -> Result<Record> {
        self.saves.lock().unwrap().push(record.clone());
        let mut saved = self.inner.save(record).await?;
        if let Some(rev) = self.forced_save_rev.lock().unwrap().take() {
            saved.rev = Some(rev);
        }
        Ok(saved)
    }

    async fn bulk_save(&self, records: Vec<Record>) -> Result<Vec<BulkResult<Record>>> {
        let call = self.bulk_calls.fetch_add(1, Ordering::SeqCst) + 1;

        if *self.failing_bulk_call.lock().unwrap() == Some(call) {
            return Ok(records
                .into_iter()
                .map(|r| Err(ItemFailure::new(r.id, "conflict", "injected failure")))
                .collect());
        }

        let partial = *self.partially_failing_bulk_call.lock().unwrap() == Some(call);
        let count = records.len();
        let mut results = Vec::with_capacity(count);
        for (index, record) in records.into_iter().enumerate() {
            if partial && index + 1 == count {
                results.push(Err(ItemFailure::new(record.id, "conflict", "injected failure")));
            } else {
                results.extend(self.inner.bulk_save(vec![record]).await?);
            }
        }
        Ok(results)
    }

    async fn purge(&self, targets: Vec<IdAndRev>) -> Result<Vec<BulkResult<IdAndRev>>> {
        self.purges.lock().unwrap().extend(targets.iter().cloned());
        if *self.failing_purges.lock().unwrap() {
            return Ok(targets
                .into_iter()
                .map(|t| Err(ItemFailure::new(t.id, "not_found", "already purged")))
                .collect());
        }
        self.inner.purge(targets).await
    }
}

#[async_trait]
impl ConflictScanner for RecordingStore {
    async fn conflicted_ids(
        &self,
        kind: EntityKind,
        limit: Option<usize>,
    ) -> Result<Vec<String>> {
        self.inner.conflicted_ids(kind, limit).await
    }
}
