//! Conflict resolution handler - streams resolved records as NDJSON.

use crate::error::{AppError, Result};
use crate::{AppState, Backend};
use axum::body::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use mend_engine::{ConflictResolver, EntityKind, IdAndRev, RecordId};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;

/// Query parameters for conflict resolution.
#[derive(Debug, Default, Deserialize)]
pub struct ResolveQuery {
    /// Maximum number of candidates to process
    pub limit: Option<usize>,
}

/// Optional request body restricting resolution to known ids.
#[derive(Debug, Default, Deserialize)]
pub struct ResolveRequest {
    pub ids: Option<Vec<RecordId>>,
}

impl ResolveRequest {
    /// Parse the request body; an empty body scans for candidates.
    pub fn from_body(body: &Bytes) -> Result<Self> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body).map_err(|e| AppError::BadRequest(e.to_string()))
    }
}

/// One line of the resolution stream.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ResolveLine {
    Resolved { id: String, rev: String },
    Failed { error: String },
}

impl From<mend_engine::Result<IdAndRev>> for ResolveLine {
    fn from(result: mend_engine::Result<IdAndRev>) -> Self {
        match result {
            Ok(IdAndRev { id, rev }) => ResolveLine::Resolved { id, rev },
            Err(err) => ResolveLine::Failed {
                error: err.to_string(),
            },
        }
    }
}

impl ResolveLine {
    fn to_ndjson(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"error":"unserializable result: {e}"}}"#)
        });
        line.push('\n');
        line
    }
}

/// Start resolving conflicts of one kind.
///
/// The returned stream produces one NDJSON line per resolved or failed
/// candidate, as soon as that candidate is done.
pub fn handle_resolve(
    state: &AppState,
    kind: EntityKind,
    query: ResolveQuery,
    request: ResolveRequest,
) -> BoxStream<'static, std::result::Result<String, Infallible>> {
    let limit = state.config.resolve_limit(query.limit);
    let backend = state.backend.clone();
    let resolver: ConflictResolver<dyn Backend, dyn Backend> =
        ConflictResolver::for_kind(backend.clone(), backend, kind);

    tracing::info!(%kind, limit, ids = ?request.ids.as_ref().map(Vec::len), "Resolving conflicts");

    resolver
        .resolve(request.ids, Some(limit))
        .map(|result| Ok(ResolveLine::from(result).to_ndjson()))
        .boxed()
}
