//! Replication conflict resolution.
//!
//! # Algorithm
//!
//! 1. Pick candidates: the ids given by the caller, or every conflicted id
//!    reported by the [`ConflictScanner`], capped by `limit`
//! 2. Fetch the candidate with its sibling revisions, then each sibling
//! 3. Fold siblings into the current revision through the
//!    [`MergeCapability`], collecting the merged ones as purgeable
//! 4. Save the folded record, producing a new revision
//! 5. Purge the merged siblings, except one that carries the new revision
//! 6. Emit the id and new revision
//!
//! Siblings the capability refuses stay in the store as open conflicts.

use crate::merge::MergeCapability;
use crate::store::{ConflictScanner, VersionedStore};
use crate::{error::Result, EntityKind, Error, IdAndRev, Record, RecordId};
use futures::stream::BoxStream;
use std::sync::Arc;

/// Fold sibling revisions into the current one.
///
/// Returns the merged record and the siblings that were absorbed into it.
/// Siblings for which `can_merge` is false are neither merged nor returned.
pub fn fold_siblings(
    capability: &dyn MergeCapability,
    current: Record,
    siblings: Vec<Record>,
) -> (Record, Vec<Record>) {
    let mut kept = current;
    let mut purgeable = Vec::with_capacity(siblings.len());

    for sibling in siblings {
        if capability.can_merge(&kept, &sibling) {
            kept = capability.merge(&kept, &sibling);
            purgeable.push(sibling);
        }
    }

    (kept, purgeable)
}

/// Resolves replication conflicts of one kind of record.
pub struct ConflictResolver<S: ?Sized, C: ?Sized> {
    store: Arc<S>,
    scanner: Arc<C>,
    capability: Arc<dyn MergeCapability>,
    kind: EntityKind,
}

impl<S, C> ConflictResolver<S, C>
where
    S: VersionedStore + ?Sized + 'static,
    C: ConflictScanner + ?Sized + 'static,
{
    /// Create a resolver with an explicit merge capability.
    pub fn new(
        store: Arc<S>,
        scanner: Arc<C>,
        kind: EntityKind,
        capability: Arc<dyn MergeCapability>,
    ) -> Self {
        Self {
            store,
            scanner,
            capability,
            kind,
        }
    }

    /// Create a resolver using the kind's own merge rules.
    pub fn for_kind(store: Arc<S>, scanner: Arc<C>, kind: EntityKind) -> Self {
        Self::new(store, scanner, kind, kind.merge_capability())
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Resolve conflicts, yielding the id and new revision of every record
    /// that was rewritten.
    ///
    /// Candidates are processed one at a time and each element is produced
    /// only once its candidate is fully handled, so dropping the stream never
    /// leaves a candidate half-resolved. A failing candidate yields an `Err`
    /// and processing moves on to the next one.
    pub fn resolve(
        &self,
        ids: Option<Vec<RecordId>>,
        limit: Option<usize>,
    ) -> BoxStream<'static, Result<IdAndRev>> {
        let store = Arc::clone(&self.store);
        let scanner = Arc::clone(&self.scanner);
        let capability = Arc::clone(&self.capability);
        let kind = self.kind;

        Box::pin(async_stream::stream! {
            let candidates = match ids {
                Some(ids) => ids,
                None => match scanner.conflicted_ids(kind, limit).await {
                    Ok(ids) => ids,
                    Err(err) => {
                        tracing::warn!(%kind, error = %err, "conflict scan failed");
                        yield Err(err);
                        return;
                    }
                },
            };
            let cap = limit.unwrap_or(usize::MAX);

            for id in candidates.into_iter().take(cap) {
                match resolve_one(store.as_ref(), capability.as_ref(), kind, &id).await {
                    Ok(Some(resolved)) => yield Ok(resolved),
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(%kind, id = %id, error = %err, "conflict resolution failed");
                        yield Err(err);
                    }
                }
            }
        })
    }
}

async fn resolve_one<S>(
    store: &S,
    capability: &dyn MergeCapability,
    kind: EntityKind,
    id: &str,
) -> Result<Option<IdAndRev>>
where
    S: VersionedStore + ?Sized,
{
    let Some(current) = store.get_with_conflicts(id).await? else {
        return Err(Error::RecordNotFound(id.to_string()));
    };
    if current.kind != kind {
        return Err(Error::InvalidRequest(format!(
            "record {id} is a {}, not a {kind}",
            current.kind
        )));
    }
    if !current.is_in_conflict() {
        tracing::debug!(id, "no open conflicts");
        return Ok(None);
    }

    let mut siblings = Vec::with_capacity(current.conflicts.len());
    for rev in &current.conflicts {
        match store.get_at_revision(id, rev).await? {
            Some(sibling) => siblings.push(sibling),
            None => tracing::debug!(id, rev = %rev, "sibling revision already gone"),
        }
    }
    let sibling_count = siblings.len();

    let (kept, purgeable) = fold_siblings(capability, current, siblings);
    let unresolved = sibling_count - purgeable.len();
    if purgeable.is_empty() {
        tracing::warn!(id, unresolved, "no sibling could be merged, record left in conflict");
        return Ok(None);
    }

    let saved = store.save(kept.without_conflicts()).await?;
    let Some(resolved) = saved.id_and_rev() else {
        return Err(Error::Store(format!("save of {id} returned no revision")));
    };

    let targets: Vec<IdAndRev> = purgeable
        .iter()
        .filter_map(Record::id_and_rev)
        .filter(|target| target.rev != resolved.rev)
        .collect();
    purge_losers(store, id, targets).await;

    if unresolved > 0 {
        tracing::warn!(id, unresolved, "some siblings could not be merged");
    }
    tracing::info!(id, rev = %resolved.rev, merged = purgeable.len(), "conflict resolved");
    Ok(Some(resolved))
}

/// Purge failures never fail the candidate: another resolver may already
/// have removed or replaced the revision.
async fn purge_losers<S>(store: &S, id: &str, targets: Vec<IdAndRev>)
where
    S: VersionedStore + ?Sized,
{
    if targets.is_empty() {
        return;
    }
    match store.purge(targets).await {
        Ok(results) => {
            for failure in results.iter().filter_map(|r| r.as_ref().err()) {
                tracing::warn!(
                    id,
                    code = %failure.code,
                    message = %failure.message,
                    "sibling purge failed"
                );
            }
        }
        Err(err) => tracing::warn!(id, error = %err, "sibling purge failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::JoinMerge;
    use crate::store::{InMemoryStore, ReplicaWriter};
    use futures::StreamExt;
    use serde_json::json;

    /// Refuses every merge.
    struct NeverMerge;

    impl MergeCapability for NeverMerge {
        fn can_merge(&self, _a: &Record, _b: &Record) -> bool {
            false
        }

        fn merge(&self, a: &Record, _b: &Record) -> Record {
            a.clone()
        }
    }

    /// Only merges siblings whose payload has `"ok": true`.
    struct MergeFlagged;

    impl MergeCapability for MergeFlagged {
        fn can_merge(&self, _a: &Record, b: &Record) -> bool {
            b.payload.get("ok") == Some(&json!(true))
        }

        fn merge(&self, a: &Record, b: &Record) -> Record {
            crate::merge::join_records(a, b)
        }
    }

    fn invoice(rev: &str, payload: serde_json::Value) -> Record {
        Record::new("inv-1", EntityKind::Invoice, payload).with_rev(rev)
    }

    #[test]
    fn fold_merges_and_collects_purgeable() {
        let current = invoice("3-c", json!({"codes": [{"id": "a"}]}));
        let siblings = vec![
            invoice("3-b", json!({"codes": [{"id": "b"}]})),
            invoice("2-a", json!({"codes": [{"id": "c"}]})),
        ];

        let (kept, purgeable) = fold_siblings(&JoinMerge, current, siblings);
        assert_eq!(kept.rev.as_deref(), Some("3-c"));
        assert_eq!(
            kept.payload,
            json!({"codes": [{"id": "a"}, {"id": "b"}, {"id": "c"}]})
        );
        let revs: Vec<_> = purgeable.iter().map(|r| r.rev.clone().unwrap()).collect();
        assert_eq!(revs, vec!["3-b".to_string(), "2-a".to_string()]);
    }

    #[test]
    fn fold_passes_over_unmergeable_siblings() {
        let current = invoice("3-c", json!({"v": 1}));
        let siblings = vec![
            invoice("3-b", json!({"ok": true, "w": 2})),
            invoice("2-a", json!({"ok": false, "x": 3})),
        ];

        let (kept, purgeable) = fold_siblings(&MergeFlagged, current, siblings);
        assert_eq!(purgeable.len(), 1);
        assert_eq!(purgeable[0].rev.as_deref(), Some("3-b"));
        assert_eq!(kept.payload, json!({"v": 1, "ok": true, "w": 2}));
    }

    #[test]
    fn fold_without_siblings_is_identity() {
        let current = invoice("1-a", json!({"v": 1}));
        let (kept, purgeable) = fold_siblings(&JoinMerge, current.clone(), vec![]);
        assert_eq!(kept, current);
        assert!(purgeable.is_empty());
    }

    #[tokio::test]
    async fn resolve_scans_when_no_ids_given() {
        let store = Arc::new(InMemoryStore::new());
        store
            .write_replicas(vec![
                invoice("1-aaa", json!({"a": 1})),
                invoice("1-bbb", json!({"b": 2})),
            ])
            .await
            .unwrap();

        let resolver = ConflictResolver::for_kind(store.clone(), store.clone(), EntityKind::Invoice);
        let results: Vec<_> = resolver.resolve(None, None).collect().await;

        assert_eq!(results.len(), 1);
        let resolved = results[0].as_ref().unwrap();
        assert_eq!(resolved.id, "inv-1");
        assert_eq!(store.leaves("inv-1"), vec![resolved.rev.clone()]);

        let current = store.get("inv-1").await.unwrap().unwrap();
        assert_eq!(current.payload, json!({"a": 1, "b": 2}));
    }

    #[tokio::test]
    async fn never_merge_leaves_record_untouched() {
        let store = Arc::new(InMemoryStore::new());
        store
            .write_replicas(vec![
                invoice("1-aaa", json!({"a": 1})),
                invoice("1-bbb", json!({"b": 2})),
            ])
            .await
            .unwrap();

        let resolver = ConflictResolver::new(
            store.clone(),
            store.clone(),
            EntityKind::Invoice,
            Arc::new(NeverMerge),
        );
        let results: Vec<_> = resolver.resolve(Some(vec!["inv-1".into()]), None).collect().await;

        assert!(results.is_empty());
        assert_eq!(
            store.leaves("inv-1"),
            vec!["1-bbb".to_string(), "1-aaa".to_string()]
        );
    }

    #[tokio::test]
    async fn unknown_id_yields_error_and_continues() {
        let store = Arc::new(InMemoryStore::new());
        store
            .write_replicas(vec![
                invoice("1-aaa", json!({"a": 1})),
                invoice("1-bbb", json!({"b": 2})),
            ])
            .await
            .unwrap();

        let resolver = ConflictResolver::for_kind(store.clone(), store.clone(), EntityKind::Invoice);
        let results: Vec<_> = resolver
            .resolve(Some(vec!["missing".into(), "inv-1".into()]), None)
            .collect()
            .await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0], Err(Error::RecordNotFound("missing".into())));
        assert_eq!(results[1].as_ref().unwrap().id, "inv-1");
    }

    #[tokio::test]
    async fn records_of_another_kind_are_left_alone() {
        let store = Arc::new(InMemoryStore::new());
        store
            .write_replicas(vec![
                Record::new("d-1", EntityKind::Document, json!({"attachmentId": "att-1"}))
                    .with_rev("2-aaa"),
                Record::new("d-1", EntityKind::Document, json!({"attachmentId": "att-2"}))
                    .with_rev("2-bbb"),
            ])
            .await
            .unwrap();

        let resolver = ConflictResolver::for_kind(store.clone(), store.clone(), EntityKind::Patient);
        let results: Vec<_> = resolver.resolve(Some(vec!["d-1".into()]), None).collect().await;

        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(Error::InvalidRequest(_))));
        assert_eq!(
            store.leaves("d-1"),
            vec!["2-bbb".to_string(), "2-aaa".to_string()]
        );
    }

    #[tokio::test]
    async fn limit_caps_processed_candidates() {
        let store = Arc::new(InMemoryStore::new());
        for id in ["inv-1", "inv-2", "inv-3"] {
            store
                .write_replicas(vec![
                    Record::new(id, EntityKind::Invoice, json!({"a": 1})).with_rev("1-aaa"),
                    Record::new(id, EntityKind::Invoice, json!({"b": 1})).with_rev("1-bbb"),
                ])
                .await
                .unwrap();
        }

        let resolver = ConflictResolver::for_kind(store.clone(), store.clone(), EntityKind::Invoice);
        let results: Vec<_> = resolver.resolve(None, Some(2)).collect().await;
        assert_eq!(results.len(), 2);

        let remaining = store
            .conflicted_ids(EntityKind::Invoice, None)
            .await
            .unwrap();
        assert_eq!(remaining, vec!["inv-3".to_string()]);

        let results: Vec<_> = resolver
            .resolve(Some(vec!["inv-3".into(), "inv-1".into()]), Some(1))
            .collect()
            .await;
        assert_eq!(results.len(), 1);
        assert!(store
            .conflicted_ids(EntityKind::Invoice, None)
            .await
            .unwrap()
            .is_empty());
    }
}
