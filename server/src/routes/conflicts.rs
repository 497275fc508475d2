//! Conflict resolution and duplicate merge routes.

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
    routing::{post, put},
    Json, Router,
};
use mend_engine::{EntityKind, Record};

use crate::error::Result;
use crate::handlers::{handle_merge, handle_resolve, MergeQuery, ResolveQuery, ResolveRequest};
use crate::AppState;

/// Create conflict and merge routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/{kind}/conflicts/resolve", post(resolve_handler))
        .route("/{kind}/{into_id}/merge/{from_id}", put(merge_handler))
}

/// POST /{kind}/conflicts/resolve - Stream resolved records as NDJSON.
async fn resolve_handler(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(query): Query<ResolveQuery>,
    body: Bytes,
) -> Result<Response> {
    let kind: EntityKind = kind.parse()?;
    let request = ResolveRequest::from_body(&body)?;
    let lines = handle_resolve(&state, kind, query, request);

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response())
}

/// PUT /{kind}/{into_id}/merge/{from_id} - Merge a duplicate into a record.
async fn merge_handler(
    State(state): State<AppState>,
    Path((kind, into_id, from_id)): Path<(String, String, String)>,
    Query(query): Query<MergeQuery>,
    Json(updated_into): Json<Record>,
) -> Result<Json<Record>> {
    let kind: EntityKind = kind.parse()?;
    let merged = handle_merge(
        state.backend.clone(),
        kind,
        &into_id,
        &from_id,
        query,
        updated_into,
    )
    .await?;
    Ok(Json(merged))
}
