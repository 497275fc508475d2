//! # Mend Engine
//!
//! Conflict resolution and duplicate merging for versioned, replicated
//! healthcare records.
//!
//! Records live in a multi-master replicated document store. Concurrent writes
//! on different replicas leave a document with sibling revisions, and
//! independent intake can produce two records for the same patient. This
//! crate repairs both situations without discarding data a concurrent writer
//! has not seen.
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A [`Record`] has a stable id, an opaque revision token used for
//! compare-and-swap writes, the sibling revisions reported by the store, and
//! sharing metadata (delegations, encryption keys, foreign keys).
//!
//! ### Stores
//!
//! The engine performs I/O only through the [`VersionedStore`],
//! [`ConflictScanner`] and [`ReplicaWriter`] traits. [`InMemoryStore`]
//! implements all three over a revision tree.
//!
//! ### Conflict Resolution
//!
//! The [`ConflictResolver`] folds every sibling of a conflicted record into
//! its current revision through a [`MergeCapability`], saves the result and
//! purges the absorbed siblings. Results are streamed as [`IdAndRev`] pairs.
//!
//! ### Duplicate Merging
//!
//! The [`DuplicateMerger`] merges one record into another with a two-phase
//! bulk commit, unioning sharing metadata and soft-deleting the source.
//!
//! ## Quick Start
//!
//! ```rust
//! use mend_engine::{
//!     ConflictResolver, EntityKind, InMemoryStore, Record, ReplicaWriter, VersionedStore,
//! };
//! use futures::StreamExt;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # futures::executor::block_on(async {
//! let store = Arc::new(InMemoryStore::new());
//!
//! // Two replicas wrote the same contact concurrently
//! store
//!     .write_replicas(vec![
//!         Record::new("c-1", EntityKind::Contact, json!({"descr": "visit"})).with_rev("1-aaa"),
//!         Record::new("c-1", EntityKind::Contact, json!({"location": "office"})).with_rev("1-bbb"),
//!     ])
//!     .await
//!     .unwrap();
//!
//! let resolver = ConflictResolver::for_kind(store.clone(), store.clone(), EntityKind::Contact);
//! let resolved: Vec<_> = resolver.resolve(None, None).collect().await;
//! assert_eq!(resolved.len(), 1);
//!
//! let contact = store.get("c-1").await.unwrap().unwrap();
//! assert_eq!(contact.payload, json!({"descr": "visit", "location": "office"}));
//! # });
//! ```

pub mod conflict;
pub mod duplicate;
pub mod error;
pub mod merge;
pub mod record;
pub mod revision;
pub mod security;
pub mod store;

// Re-export main types at crate root
pub use conflict::{fold_siblings, ConflictResolver};
pub use duplicate::DuplicateMerger;
pub use error::{Error, Result};
pub use merge::{join_records, join_values, JoinMerge, MatchingFieldsMerge, MergeCapability};
pub use record::{EntityKind, IdAndRev, ProtectedMetadata, Record};
pub use security::{AccessLevel, Delegation, DelegationMap, SecureDelegation, SecurityMetadata};
pub use store::{
    BulkResult, ConflictScanner, InMemoryStore, ItemFailure, ReplicaWriter, VersionedStore,
};

/// Type aliases for clarity
pub type RecordId = String;
pub type Revision = String;
pub type DataOwnerId = String;
pub type Timestamp = u64;
