//! Revision token generation.
//!
//! Tokens have the form `"{generation}-{digest}"`. The digest covers the
//! parent token and the canonical JSON content, so two writers producing the
//! same content on top of the same parent obtain the same token.

use crate::{Error, Record, Result, Revision};
use sha2::{Digest, Sha256};

/// Number of digest bytes kept in a token.
const DIGEST_BYTES: usize = 16;

/// Largest generation a token may carry. Stores index generations as signed
/// 64-bit integers.
pub const MAX_GENERATION: u64 = i64::MAX as u64;

/// Generation number encoded in a revision token.
pub fn generation(rev: &str) -> Option<u64> {
    rev.split_once('-')
        .and_then(|(generation, _)| generation.parse().ok())
}

/// Generation of a token produced by another replica, rejecting tokens a
/// store could not index or build on.
pub fn replica_generation(rev: &str) -> Result<u64> {
    match generation(rev) {
        Some(generation) if (1..=MAX_GENERATION).contains(&generation) => Ok(generation),
        Some(generation) => Err(Error::InvalidRequest(format!(
            "revision {rev} has out-of-range generation {generation}"
        ))),
        None => Err(Error::InvalidRequest(format!("malformed revision token {rev}"))),
    }
}

/// Compute the token of a new revision written on top of `parent`.
pub fn next_revision(parent: Option<&str>, record: &Record) -> Result<Revision> {
    let next_generation = parent
        .and_then(generation)
        .unwrap_or(0)
        .checked_add(1)
        .filter(|generation| *generation <= MAX_GENERATION)
        .ok_or_else(|| {
            Error::InvalidRequest(format!(
                "revision {} of {} cannot be extended",
                parent.unwrap_or_default(),
                record.id
            ))
        })?;

    let mut content = record.clone().without_conflicts();
    content.rev = None;
    let canonical = serde_json::to_vec(&content)?;

    let mut hasher = Sha256::new();
    hasher.update(parent.unwrap_or_default().as_bytes());
    hasher.update([0u8]);
    hasher.update(&canonical);
    let digest = hasher.finalize();

    Ok(format!(
        "{}-{}",
        next_generation,
        hex::encode(&digest[..DIGEST_BYTES])
    ))
}
