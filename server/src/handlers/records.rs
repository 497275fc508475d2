//! Record handlers - reads, compare-and-swap saves and replica ingestion.

use crate::error::{AppError, Result};
use crate::Backend;
use mend_engine::{EntityKind, Record, ReplicaWriter, VersionedStore};
use serde::{Deserialize, Serialize};

/// Query parameters for fetching a record.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetRecordQuery {
    /// Include sibling revision tokens
    #[serde(default)]
    pub conflicts: bool,
    /// Fetch this exact revision instead of the winner
    pub rev: Option<String>,
}

/// Request body for replica ingestion.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicateRequest {
    pub records: Vec<Record>,
}

/// Per-record outcome of a replica write.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicateItem {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Response for replica ingestion.
#[derive(Debug, Serialize)]
pub struct ReplicateResponse {
    pub results: Vec<ReplicateItem>,
}

/// Fetch a record of the given kind.
pub async fn handle_get(
    backend: &dyn Backend,
    kind: EntityKind,
    id: &str,
    query: GetRecordQuery,
) -> Result<Record> {
    let record = match (&query.rev, query.conflicts) {
        (Some(rev), _) => backend.get_at_revision(id, rev).await?,
        (None, true) => backend.get_with_conflicts(id).await?,
        (None, false) => backend.get(id).await?,
    };

    record
        .filter(|record| record.kind == kind)
        .ok_or_else(|| AppError::NotFound(format!("{kind} {id}")))
}

/// Save a record, creating it when it carries no revision.
pub async fn handle_save(backend: &dyn Backend, kind: EntityKind, record: Record) -> Result<Record> {
    if record.kind != kind {
        return Err(AppError::BadRequest(format!(
            "record {} is a {}, not a {kind}",
            record.id, record.kind
        )));
    }

    let saved = backend.save(record).await?;
    tracing::debug!(id = %saved.id, rev = ?saved.rev, "Saved record");
    Ok(saved)
}

/// Store revisions exactly as another replica produced them.
pub async fn handle_replicate(
    backend: &dyn Backend,
    request: ReplicateRequest,
) -> Result<ReplicateResponse> {
    if request.records.is_empty() {
        return Ok(ReplicateResponse { results: vec![] });
    }

    let count = request.records.len();
    let results = backend
        .write_replicas(request.records)
        .await?
        .into_iter()
        .map(|result| match result {
            Ok(written) => ReplicateItem {
                id: written.id,
                rev: Some(written.rev),
                error: None,
                reason: None,
            },
            Err(failure) => ReplicateItem {
                id: failure.id,
                rev: None,
                error: Some(failure.code),
                reason: Some(failure.message),
            },
        })
        .collect();

    tracing::info!("Replicated {} revisions", count);
    Ok(ReplicateResponse { results })
}
