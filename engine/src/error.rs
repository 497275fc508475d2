//! Error types for the mend engine.

use crate::{RecordId, Revision};
use thiserror::Error;

/// All possible errors from the mend engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Lookup errors
    #[error("record not found: {0}")]
    RecordNotFound(RecordId),

    // Concurrency errors
    #[error("stale revision for {id}: expected {expected}, current is {}", actual.as_deref().unwrap_or("<none>"))]
    StaleRevision {
        id: RecordId,
        expected: Revision,
        actual: Option<Revision>,
    },

    #[error("revision conflict on {id}: {message}")]
    RevisionConflict { id: RecordId, message: String },

    // Validation errors
    #[error("record {id} carries a modified {field}; metadata is computed by the merge")]
    MetadataChangeRejected { id: RecordId, field: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Fatal errors
    #[error("duplicate merge of {from} into {into} left the store inconsistent: {details}")]
    PhaseInconsistency {
        from: RecordId,
        into: RecordId,
        details: String,
    },

    #[error("store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Whether retrying the same call with fresh revisions may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StaleRevision { .. } | Error::RevisionConflict { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
