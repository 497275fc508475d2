//! Store contracts and an in-memory replicated store.
//!
//! The engine talks to persistence only through [`VersionedStore`],
//! [`ConflictScanner`] and [`ReplicaWriter`]. [`InMemoryStore`] keeps a full
//! revision tree per document, which makes it usable both in tests and as an
//! embedded backend.

use crate::{
    error::Result, revision, EntityKind, Error, IdAndRev, Record, RecordId, Revision,
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Failure of one item in a bulk call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemFailure {
    pub id: RecordId,
    pub code: String,
    pub message: String,
}

impl ItemFailure {
    pub fn new(id: impl Into<RecordId>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            code: code.into(),
            message: message.into(),
        }
    }

    /// Build a failure from an engine error, picking a stable code.
    pub fn from_error(id: impl Into<RecordId>, err: &Error) -> Self {
        let code = match err {
            Error::RecordNotFound(_) => "not_found",
            Error::StaleRevision { .. } | Error::RevisionConflict { .. } => "conflict",
            Error::InvalidRequest(_) | Error::MetadataChangeRejected { .. } => "bad_request",
            _ => "internal",
        };
        Self::new(id, code, err.to_string())
    }
}

/// Per-item outcome of a bulk call.
pub type BulkResult<T> = std::result::Result<T, ItemFailure>;

/// Document store with revision-based optimistic concurrency.
#[async_trait]
pub trait VersionedStore: Send + Sync {
    /// Current (winning) revision of a record, without conflicts.
    async fn get(&self, id: &str) -> Result<Option<Record>>;

    /// Current revision with `conflicts` populated.
    async fn get_with_conflicts(&self, id: &str) -> Result<Option<Record>>;

    /// A record at an exact revision.
    async fn get_at_revision(&self, id: &str, rev: &str) -> Result<Option<Record>>;

    /// Write a record. `record.rev` must name the revision being replaced.
    async fn save(&self, record: Record) -> Result<Record>;

    /// Write several records; failures are reported per item.
    async fn bulk_save(&self, records: Vec<Record>) -> Result<Vec<BulkResult<Record>>>;

    /// Permanently remove specific revisions.
    async fn purge(&self, targets: Vec<IdAndRev>) -> Result<Vec<BulkResult<IdAndRev>>>;
}

/// Enumerates documents with open replication conflicts.
#[async_trait]
pub trait ConflictScanner: Send + Sync {
    async fn conflicted_ids(&self, kind: EntityKind, limit: Option<usize>)
        -> Result<Vec<RecordId>>;
}

/// Accepts revisions produced elsewhere, keeping their tokens.
///
/// This is how replication delivers concurrent writes, and the only way a
/// document acquires siblings.
#[async_trait]
pub trait ReplicaWriter: Send + Sync {
    async fn write_replicas(&self, records: Vec<Record>) -> Result<Vec<BulkResult<IdAndRev>>>;
}

/// One stored revision of a document.
#[derive(Debug, Clone)]
struct StoredRevision {
    record: Record,
    generation: u64,
    leaf: bool,
}

/// All known revisions of one document.
#[derive(Debug, Default)]
struct RevisionTree {
    revisions: BTreeMap<Revision, StoredRevision>,
}

impl RevisionTree {
    /// Leaves ordered from winner to weakest sibling.
    fn leaves(&self) -> Vec<&StoredRevision> {
        let mut leaves: Vec<_> = self.revisions.values().filter(|r| r.leaf).collect();
        leaves.sort_by(|a, b| {
            (b.generation, &b.record.rev).cmp(&(a.generation, &a.record.rev))
        });
        leaves
    }

    fn winner(&self) -> Option<&StoredRevision> {
        self.leaves().into_iter().next()
    }

    fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    fn check_parent(&self, record: &Record) -> Result<()> {
        match &record.rev {
            None if self.is_empty() => Ok(()),
            None => Err(Error::RevisionConflict {
                id: record.id.clone(),
                message: "document already exists".into(),
            }),
            Some(rev) => match self.revisions.get(rev) {
                Some(stored) if stored.leaf => Ok(()),
                Some(_) => Err(Error::RevisionConflict {
                    id: record.id.clone(),
                    message: format!("revision {rev} has already been updated"),
                }),
                None if self.is_empty() => Err(Error::RecordNotFound(record.id.clone())),
                None => Err(Error::RevisionConflict {
                    id: record.id.clone(),
                    message: format!("unknown revision {rev}"),
                }),
            },
        }
    }

    fn insert_leaf(&mut self, record: Record, generation: u64) {
        if let Some(rev) = record.rev.clone() {
            self.revisions.insert(
                rev,
                StoredRevision {
                    record,
                    generation,
                    leaf: true,
                },
            );
        }
    }
}

/// In-memory revision-tree store.
///
/// Winner selection follows the replicated document store convention: the
/// leaf with the highest `(generation, rev)` wins and every other leaf is
/// reported as a conflict.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    docs: DashMap<RecordId, RevisionTree>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            docs: DashMap::new(),
        }
    }

    /// Number of documents holding at least one revision.
    pub fn len(&self) -> usize {
        self.docs.iter().filter(|tree| !tree.is_empty()).count()
    }

    /// Check if the store holds no documents.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Leaf revisions of a document, winner first.
    pub fn leaves(&self, id: &str) -> Vec<Revision> {
        self.docs
            .get(id)
            .map(|tree| {
                tree.leaves()
                    .into_iter()
                    .filter_map(|r| r.record.rev.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether an exact revision is still stored.
    pub fn contains_revision(&self, id: &str, rev: &str) -> bool {
        self.docs
            .get(id)
            .is_some_and(|tree| tree.revisions.contains_key(rev))
    }

    fn save_one(&self, record: Record) -> Result<Record> {
        let record = record.without_conflicts();
        let mut tree = self.docs.entry(record.id.clone()).or_default();
        tree.check_parent(&record)?;

        let parent = record.rev.clone();
        let new_rev = revision::next_revision(parent.as_deref(), &record)?;
        let generation = revision::generation(&new_rev).unwrap_or(1);

        if let Some(parent) = parent.as_ref().and_then(|rev| tree.revisions.get_mut(rev)) {
            parent.leaf = false;
        }

        let saved = Record {
            rev: Some(new_rev),
            ..record
        };
        tree.insert_leaf(saved.clone(), generation);
        Ok(saved)
    }

    fn purge_one(&self, target: &IdAndRev) -> BulkResult<IdAndRev> {
        let removed = self
            .docs
            .get_mut(&target.id)
            .and_then(|mut tree| tree.revisions.remove(&target.rev));
        self.docs.remove_if(&target.id, |_, tree| tree.is_empty());

        match removed {
            Some(_) => Ok(target.clone()),
            None => Err(ItemFailure::new(
                target.id.clone(),
                "not_found",
                format!("revision {} is not stored", target.rev),
            )),
        }
    }

    fn replicate_one(&self, record: Record) -> BulkResult<IdAndRev> {
        let record = record.without_conflicts();
        let Some(rev) = record.rev.clone() else {
            return Err(ItemFailure::new(
                record.id,
                "bad_request",
                "replicated revisions must carry a revision token",
            ));
        };
        let generation = match revision::replica_generation(&rev) {
            Ok(generation) => generation,
            Err(err) => return Err(ItemFailure::from_error(record.id, &err)),
        };

        let id_and_rev = IdAndRev::new(record.id.clone(), rev.clone());
        let mut tree = self.docs.entry(record.id.clone()).or_default();
        if !tree.revisions.contains_key(&rev) {
            tree.insert_leaf(record, generation);
        }
        Ok(id_and_rev)
    }
}

#[async_trait]
impl VersionedStore for InMemoryStore {
    async fn get(&self, id: &str) -> Result<Option<Record>> {
        Ok(self
            .docs
            .get(id)
            .and_then(|tree| tree.winner().map(|r| r.record.clone())))
    }

    async fn get_with_conflicts(&self, id: &str) -> Result<Option<Record>> {
        Ok(self.docs.get(id).and_then(|tree| {
            let leaves = tree.leaves();
            let (winner, siblings) = leaves.split_first()?;
            let mut record = winner.record.clone();
            record.conflicts = siblings
                .iter()
                .filter_map(|r| r.record.rev.clone())
                .collect();
            Some(record)
        }))
    }

    async fn get_at_revision(&self, id: &str, rev: &str) -> Result<Option<Record>> {
        Ok(self
            .docs
            .get(id)
            .and_then(|tree| tree.revisions.get(rev).map(|r| r.record.clone())))
    }

    async fn save(&self, record: Record) -> Result<Record> {
        let id = record.id.clone();
        let result = self.save_one(record);
        if result.is_err() {
            self.docs.remove_if(&id, |_, tree| tree.is_empty());
        }
        result
    }

    async fn bulk_save(&self, records: Vec<Record>) -> Result<Vec<BulkResult<Record>>> {
        let mut results = Vec::with_capacity(records.len());
        for record in records {
            let id = record.id.clone();
            results.push(
                self.save(record)
                    .await
                    .map_err(|err| ItemFailure::from_error(id, &err)),
            );
        }
        Ok(results)
    }

    async fn purge(&self, targets: Vec<IdAndRev>) -> Result<Vec<BulkResult<IdAndRev>>> {
        Ok(targets.iter().map(|target| self.purge_one(target)).collect())
    }
}

#[async_trait]
impl ConflictScanner for InMemoryStore {
    async fn conflicted_ids(
        &self,
        kind: EntityKind,
        limit: Option<usize>,
    ) -> Result<Vec<RecordId>> {
        let mut ids: Vec<RecordId> = self
            .docs
            .iter()
            .filter(|entry| {
                let leaves = entry.leaves();
                leaves.len() > 1 && leaves[0].record.kind == kind
            })
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        if let Some(limit) = limit {
            ids.truncate(limit);
        }
        Ok(ids)
    }
}

#[async_trait]
impl ReplicaWriter for InMemoryStore {
    async fn write_replicas(&self, records: Vec<Record>) -> Result<Vec<BulkResult<IdAndRev>>> {
        Ok(records
            .into_iter()
            .map(|record| self.replicate_one(record))
            .collect())
    }
}
