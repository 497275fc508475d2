//! Merging of duplicate records that represent the same subject.
//!
//! The caller supplies the surviving record with its content already
//! updated. The engine validates revisions and metadata, computes the merged
//! metadata itself, and writes both records in two bulk calls:
//!
//! 1. A no-op save of `from` and `into`, which invalidates any revision token
//!    another writer may still hold
//! 2. The real update: `from` soft-deleted and pointing at `into`, `into`
//!    carrying the merged metadata
//!
//! A failure in step 1 is a retryable revision conflict. A failure in step
//! 2 leaves the store with bumped but unmigrated records and is reported as
//! [`Error::PhaseInconsistency`].

use crate::security::union_delegations;
use crate::store::{BulkResult, VersionedStore};
use crate::{error::Result, Error, Record, Timestamp};
use std::sync::Arc;

/// Merges duplicate records through a two-phase bulk commit.
///
/// Concurrent merges touching the same records must be coordinated by the
/// caller; the protocol narrows the race window but does not close it.
pub struct DuplicateMerger<S: ?Sized> {
    store: Arc<S>,
}

impl<S> DuplicateMerger<S>
where
    S: VersionedStore + ?Sized,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Merge record `from_id` into `updated_into`.
    ///
    /// `expected_from_rev` and `updated_into.rev` must both be current.
    /// `updated_into` may change content but not the protected metadata.
    /// `timestamp` becomes the deletion date of `from`.
    pub async fn merge_into(
        &self,
        from_id: &str,
        expected_from_rev: &str,
        updated_into: Record,
        timestamp: Timestamp,
    ) -> Result<Record> {
        if from_id == updated_into.id {
            return Err(Error::InvalidRequest(format!(
                "cannot merge {from_id} into itself"
            )));
        }
        let Some(expected_into_rev) = updated_into.rev.clone() else {
            return Err(Error::InvalidRequest(format!(
                "record {} has no revision",
                updated_into.id
            )));
        };

        let (from, into) = futures::try_join!(
            self.fetch(from_id),
            self.fetch(&updated_into.id)
        )?;

        check_revision(&from, expected_from_rev)?;
        check_revision(&into, &expected_into_rev)?;
        if from.kind != into.kind {
            return Err(Error::InvalidRequest(format!(
                "cannot merge a {} into a {}",
                from.kind, into.kind
            )));
        }
        if updated_into.kind != into.kind {
            return Err(Error::InvalidRequest(format!(
                "record {} is a {}, not a {}",
                into.id, into.kind, updated_into.kind
            )));
        }
        if let Some(field) = into
            .protected_metadata()
            .first_difference(&updated_into.protected_metadata())
        {
            return Err(Error::MetadataChangeRejected {
                id: into.id.clone(),
                field: field.to_string(),
            });
        }

        // Phase 1: invalidate revisions other writers may hold.
        let bumped = self
            .store
            .bulk_save(vec![from.clone(), into.clone()])
            .await?;
        let (bumped_from, bumped_into) = match successes(bumped) {
            Ok(pair) => pair,
            Err(details) => {
                tracing::warn!(from = %from.id, into = %into.id, %details, "revision invalidation failed");
                return Err(Error::RevisionConflict {
                    id: into.id.clone(),
                    message: format!("revision invalidation failed: {details}"),
                });
            }
        };

        // Phase 2: the real update, on top of the fresh revisions.
        let merged_into = merged_record(&bumped_from, &bumped_into, updated_into);
        let deleted_from = Record {
            deletion_date: Some(timestamp),
            merged_to_id: Some(into.id.clone()),
            ..bumped_from.clone()
        };

        let written = self
            .store
            .bulk_save(vec![deleted_from, merged_into])
            .await
            .map_err(|err| Error::PhaseInconsistency {
                from: from.id.clone(),
                into: into.id.clone(),
                details: err.to_string(),
            })?;
        match successes(written) {
            Ok((_, saved_into)) => {
                tracing::info!(
                    from = %from.id,
                    into = %saved_into.id,
                    rev = saved_into.rev.as_deref().unwrap_or_default(),
                    "duplicate merged"
                );
                Ok(saved_into)
            }
            Err(details) => {
                tracing::error!(
                    from = %from.id,
                    from_rev = bumped_from.rev.as_deref().unwrap_or_default(),
                    into = %into.id,
                    into_rev = bumped_into.rev.as_deref().unwrap_or_default(),
                    %details,
                    "duplicate merge failed after revisions were invalidated, manual reconciliation required"
                );
                Err(Error::PhaseInconsistency {
                    from: from.id,
                    into: into.id,
                    details,
                })
            }
        }
    }

    async fn fetch(&self, id: &str) -> Result<Record> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| Error::RecordNotFound(id.to_string()))
    }
}

fn check_revision(record: &Record, expected: &str) -> Result<()> {
    if record.rev.as_deref() == Some(expected) {
        Ok(())
    } else {
        Err(Error::StaleRevision {
            id: record.id.clone(),
            expected: expected.to_string(),
            actual: record.rev.clone(),
        })
    }
}

/// Both records of a two-item bulk save, or a description of what failed.
fn successes(results: Vec<BulkResult<Record>>) -> std::result::Result<(Record, Record), String> {
    let count = results.len();
    let mut saved = Vec::with_capacity(2);
    let mut failures = Vec::new();
    for result in results {
        match result {
            Ok(record) => saved.push(record),
            Err(failure) => failures.push(format!(
                "{}: {} ({})",
                failure.id, failure.code, failure.message
            )),
        }
    }

    match <[Record; 2]>::try_from(saved) {
        Ok([first, second]) => Ok((first, second)),
        Err(saved) if failures.is_empty() => Err(format!(
            "expected 2 updates, store reported {} of {count}",
            saved.len()
        )),
        Err(_) => Err(failures.join("; ")),
    }
}

/// The surviving record: caller content plus engine-computed metadata.
fn merged_record(from: &Record, into: &Record, updated_into: Record) -> Record {
    let mut merged_ids = into.merged_ids.clone();
    merged_ids.insert(from.id.clone());

    let security_metadata = match (&into.security_metadata, &from.security_metadata) {
        (Some(into_meta), Some(from_meta)) => Some(into_meta.merge_preferring(from_meta)),
        (Some(only), None) | (None, Some(only)) => Some(only.clone()),
        (None, None) => None,
    };

    Record {
        rev: into.rev.clone(),
        conflicts: Vec::new(),
        merged_ids,
        delegations: union_delegations(&into.delegations, &from.delegations),
        encryption_keys: into.encryption_keys.clone(),
        crypted_foreign_keys: union_delegations(
            &into.crypted_foreign_keys,
            &from.crypted_foreign_keys,
        ),
        secret_foreign_keys: into
            .secret_foreign_keys
            .union(&from.secret_foreign_keys)
            .cloned()
            .collect(),
        security_metadata,
        ..updated_into
    }
}
