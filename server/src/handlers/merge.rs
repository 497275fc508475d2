//! Duplicate merge handler.

use crate::error::{AppError, Result};
use crate::Backend;
use mend_engine::{DuplicateMerger, EntityKind, Record};
use serde::Deserialize;
use std::sync::Arc;

/// Query parameters for a duplicate merge.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeQuery {
    /// Revision of the source record the caller based the merge on
    pub expected_from_rev: String,
}

/// Merge `from_id` into the record in the request body.
pub async fn handle_merge(
    backend: Arc<dyn Backend>,
    kind: EntityKind,
    into_id: &str,
    from_id: &str,
    query: MergeQuery,
    updated_into: Record,
) -> Result<Record> {
    if updated_into.id != into_id {
        return Err(AppError::BadRequest(format!(
            "body id {} does not match path id {into_id}",
            updated_into.id
        )));
    }
    if updated_into.kind != kind {
        return Err(AppError::BadRequest(format!(
            "record {into_id} is a {}, not a {kind}",
            updated_into.kind
        )));
    }

    let timestamp = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default();
    let merger = DuplicateMerger::new(backend);
    let merged = merger
        .merge_into(from_id, &query.expected_from_rev, updated_into, timestamp)
        .await?;

    tracing::info!(%kind, from = %from_id, into = %into_id, rev = ?merged.rev, "Merged duplicate records");
    Ok(merged)
}
