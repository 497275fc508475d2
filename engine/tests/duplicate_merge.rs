//! Duplicate merge protocol against a recording store.

mod common;

use common::RecordingStore;
use mend_engine::{
    Delegation, DuplicateMerger, EntityKind, Error, Record, VersionedStore,
};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;

const NOW: u64 = 1_717_171_717_000;

/// `from` delegates to X with foreign key fk1, `into` to Y with fk2.
async fn seeded() -> (Arc<RecordingStore>, Record, Record) {
    let store = Arc::new(RecordingStore::new());

    let mut from = Record::new("from", EntityKind::Patient, json!({"lastName": "Doe"}));
    from.delegations
        .insert("X".into(), BTreeSet::from([Delegation::new("X", "X", "kx")]));
    from.secret_foreign_keys.insert("fk1".into());

    let mut into = Record::new("into", EntityKind::Patient, json!({"lastName": "Doe"}));
    into.delegations
        .insert("Y".into(), BTreeSet::from([Delegation::new("Y", "Y", "ky")]));
    into.secret_foreign_keys.insert("fk2".into());
    into.merged_ids.insert("older-duplicate".into());

    let from = store.inner.save(from).await.unwrap();
    let into = store.inner.save(into).await.unwrap();
    (store, from, into)
}

fn merger(store: &Arc<RecordingStore>) -> DuplicateMerger<RecordingStore> {
    DuplicateMerger::new(store.clone())
}

#[tokio::test]
async fn metadata_is_unioned_and_source_soft_deleted() {
    let (store, from, into) = seeded().await;

    let mut updated = into.clone();
    updated.payload = json!({"lastName": "Doe", "ssin": "12345"});

    let merged = merger(&store)
        .merge_into("from", from.rev.as_deref().unwrap(), updated, NOW)
        .await
        .unwrap();

    let owners: Vec<_> = merged.delegations.keys().cloned().collect();
    assert_eq!(owners, vec!["X".to_string(), "Y".to_string()]);
    assert_eq!(
        merged.secret_foreign_keys,
        BTreeSet::from(["fk1".to_string(), "fk2".to_string()])
    );
    assert_eq!(
        merged.merged_ids,
        BTreeSet::from(["from".to_string(), "older-duplicate".to_string()])
    );
    assert_eq!(merged.payload["ssin"], "12345");

    let stored_from = store.get("from").await.unwrap().unwrap();
    assert_eq!(stored_from.deletion_date, Some(NOW));
    assert_eq!(stored_from.merged_to_id.as_deref(), Some("into"));
    assert_eq!(stored_from.payload, from.payload);

    // Both phases went through bulk saves only.
    assert_eq!(store.bulk_calls(), 2);
    assert!(store.saves().is_empty());
    assert!(store.purged().is_empty());
}

#[tokio::test]
async fn stale_source_revision_performs_no_writes() {
    let (store, _from, into) = seeded().await;

    let err = merger(&store)
        .merge_into("from", "rev-0", into, NOW)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::StaleRevision { ref id, ref expected, .. }
        if id == "from" && expected == "rev-0"));
    assert_eq!(store.write_calls(), 0);
}

#[tokio::test]
async fn tampered_delegations_are_rejected_before_writing() {
    let (store, from, into) = seeded().await;

    let mut tampered = into.clone();
    tampered
        .delegations
        .insert("Z".into(), BTreeSet::from([Delegation::new("Z", "Z", "kz")]));

    let err = merger(&store)
        .merge_into("from", from.rev.as_deref().unwrap(), tampered, NOW)
        .await
        .unwrap_err();

    assert_eq!(
        err,
        Error::MetadataChangeRejected {
            id: "into".into(),
            field: "delegations".into(),
        }
    );
    assert_eq!(store.write_calls(), 0);
}

#[tokio::test]
async fn tampered_merged_ids_are_rejected() {
    let (store, from, into) = seeded().await;

    let mut tampered = into.clone();
    tampered.merged_ids.clear();

    let err = merger(&store)
        .merge_into("from", from.rev.as_deref().unwrap(), tampered, NOW)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MetadataChangeRejected { ref field, .. } if field == "mergedIds"));
    assert_eq!(store.write_calls(), 0);
}

#[tokio::test]
async fn phase_one_failure_is_a_retryable_conflict() {
    let (store, from, into) = seeded().await;
    store.fail_last_item_of_bulk_call(1);

    let err = merger(&store)
        .merge_into("from", from.rev.as_deref().unwrap(), into.clone(), NOW)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::RevisionConflict { .. }));
    assert!(err.is_retryable());
    assert_eq!(store.bulk_calls(), 1, "phase 2 must not run");

    let stored_into = store.get("into").await.unwrap().unwrap();
    assert_eq!(stored_into.rev, into.rev);
    assert!(!store.get("from").await.unwrap().unwrap().is_deleted());
}

#[tokio::test]
async fn phase_two_failure_is_fatal() {
    let (store, from, into) = seeded().await;
    store.fail_bulk_call(2);

    let err = merger(&store)
        .merge_into("from", from.rev.as_deref().unwrap(), into.clone(), NOW)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::PhaseInconsistency { ref from, ref into, .. }
        if from == "from" && into == "into"));
    assert!(!err.is_retryable());

    // Revisions were invalidated but nothing was migrated.
    let stored_from = store.get("from").await.unwrap().unwrap();
    assert_ne!(stored_from.rev, from.rev);
    assert!(!stored_from.is_deleted());
    let stored_into = store.get("into").await.unwrap().unwrap();
    assert_ne!(stored_into.rev, into.rev);
    assert!(!stored_into.merged_ids.contains("from"));
}

#[tokio::test]
async fn concurrent_writer_holding_old_revision_is_locked_out() {
    let (store, from, into) = seeded().await;

    merger(&store)
        .merge_into("from", from.rev.as_deref().unwrap(), into.clone(), NOW)
        .await
        .unwrap();

    // A writer that read `into` before the merge can no longer save it.
    let mut late = into.clone();
    late.payload = json!({"lastName": "Smith"});
    let err = store.save(late).await.unwrap_err();
    assert!(matches!(err, Error::RevisionConflict { .. }));
}
