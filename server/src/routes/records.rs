//! Record endpoint routes.

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use mend_engine::{EntityKind, Record};

use crate::error::Result;
use crate::handlers::{
    handle_get, handle_replicate, handle_save, GetRecordQuery, ReplicateRequest,
    ReplicateResponse,
};
use crate::AppState;

/// Create record routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/_replicate", post(replicate_handler))
        .route("/{kind}", post(save_handler))
        .route("/{kind}/{id}", get(get_handler))
}

/// GET /{kind}/{id} - Fetch the winner, the winner with conflicts, or an exact revision.
async fn get_handler(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
    Query(query): Query<GetRecordQuery>,
) -> Result<Json<Record>> {
    let kind: EntityKind = kind.parse()?;
    let record = handle_get(state.backend.as_ref(), kind, &id, query).await?;
    Ok(Json(record))
}

/// POST /{kind} - Save a record.
async fn save_handler(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Json(record): Json<Record>,
) -> Result<Json<Record>> {
    let kind: EntityKind = kind.parse()?;
    let saved = handle_save(state.backend.as_ref(), kind, record).await?;
    Ok(Json(saved))
}

/// POST /_replicate - Ingest revisions written on another replica.
async fn replicate_handler(
    State(state): State<AppState>,
    Json(request): Json<ReplicateRequest>,
) -> Result<Json<ReplicateResponse>> {
    let response = handle_replicate(state.backend.as_ref(), request).await?;
    Ok(Json(response))
}
