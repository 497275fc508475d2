//! Versioned record types.

use crate::security::{DelegationMap, SecurityMetadata};
use crate::{Error, RecordId, Revision, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// The kind of entity a record holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Patient,
    Contact,
    Invoice,
    Message,
    HealthElement,
    Document,
    Form,
    CalendarItem,
    Classification,
    AccessLog,
}

impl EntityKind {
    pub const ALL: [EntityKind; 10] = [
        EntityKind::Patient,
        EntityKind::Contact,
        EntityKind::Invoice,
        EntityKind::Message,
        EntityKind::HealthElement,
        EntityKind::Document,
        EntityKind::Form,
        EntityKind::CalendarItem,
        EntityKind::Classification,
        EntityKind::AccessLog,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Patient => "patient",
            EntityKind::Contact => "contact",
            EntityKind::Invoice => "invoice",
            EntityKind::Message => "message",
            EntityKind::HealthElement => "healthElement",
            EntityKind::Document => "document",
            EntityKind::Form => "form",
            EntityKind::CalendarItem => "calendarItem",
            EntityKind::Classification => "classification",
            EntityKind::AccessLog => "accessLog",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::InvalidRequest(format!("unknown entity kind: {s}")))
    }
}

/// Identity of one specific revision of a record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdAndRev {
    pub id: RecordId,
    pub rev: Revision,
}

impl IdAndRev {
    pub fn new(id: impl Into<RecordId>, rev: impl Into<Revision>) -> Self {
        Self {
            id: id.into(),
            rev: rev.into(),
        }
    }
}

/// A versioned record in the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Stable identity, shared by every revision
    pub id: RecordId,
    /// Revision token; absent for records never written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<Revision>,
    /// Sibling revisions, only populated when explicitly requested
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<Revision>,
    pub kind: EntityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<Timestamp>,
    /// Soft-delete marker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_date: Option<Timestamp>,
    /// Set on a duplicate that was merged into another record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_to_id: Option<RecordId>,
    /// Duplicates that were merged into this record
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub merged_ids: BTreeSet<RecordId>,
    #[serde(default, skip_serializing_if = "DelegationMap::is_empty")]
    pub delegations: DelegationMap,
    #[serde(default, skip_serializing_if = "DelegationMap::is_empty")]
    pub encryption_keys: DelegationMap,
    #[serde(default, skip_serializing_if = "DelegationMap::is_empty")]
    pub crypted_foreign_keys: DelegationMap,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub secret_foreign_keys: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_metadata: Option<SecurityMetadata>,
    /// Clinical content, opaque to the engine except for merging
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Record {
    /// Create a new, never written record.
    pub fn new(id: impl Into<RecordId>, kind: EntityKind, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            rev: None,
            conflicts: Vec::new(),
            kind,
            modified: None,
            deletion_date: None,
            merged_to_id: None,
            merged_ids: BTreeSet::new(),
            delegations: DelegationMap::new(),
            encryption_keys: DelegationMap::new(),
            crypted_foreign_keys: DelegationMap::new(),
            secret_foreign_keys: BTreeSet::new(),
            security_metadata: None,
            payload,
        }
    }

    /// Builder-style revision setter.
    pub fn with_rev(mut self, rev: impl Into<Revision>) -> Self {
        self.rev = Some(rev.into());
        self
    }

    /// Whether the store reported sibling revisions for this record.
    pub fn is_in_conflict(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// Whether the record is soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.deletion_date.is_some()
    }

    /// The record with its conflict list dropped, ready to be written.
    pub fn without_conflicts(mut self) -> Self {
        self.conflicts.clear();
        self
    }

    /// The id/revision pair of this record, if it has been written.
    pub fn id_and_rev(&self) -> Option<IdAndRev> {
        self.rev
            .as_ref()
            .map(|rev| IdAndRev::new(self.id.clone(), rev.clone()))
    }

    /// Metadata that callers may not change on a duplicate merge.
    pub fn protected_metadata(&self) -> ProtectedMetadata<'_> {
        ProtectedMetadata {
            delegations: &self.delegations,
            encryption_keys: &self.encryption_keys,
            crypted_foreign_keys: &self.crypted_foreign_keys,
            secret_foreign_keys: &self.secret_foreign_keys,
            security_metadata: self.security_metadata.as_ref(),
            merged_ids: &self.merged_ids,
            deletion_date: self.deletion_date,
            merged_to_id: self.merged_to_id.as_deref(),
        }
    }
}

/// Borrowed view of a record's engine-managed metadata.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProtectedMetadata<'a> {
    pub delegations: &'a DelegationMap,
    pub encryption_keys: &'a DelegationMap,
    pub crypted_foreign_keys: &'a DelegationMap,
    pub secret_foreign_keys: &'a BTreeSet<String>,
    pub security_metadata: Option<&'a SecurityMetadata>,
    pub merged_ids: &'a BTreeSet<RecordId>,
    pub deletion_date: Option<Timestamp>,
    pub merged_to_id: Option<&'a str>,
}

impl ProtectedMetadata<'_> {
    /// Name of the first field that differs from `other`, if any.
    pub fn first_difference(&self, other: &ProtectedMetadata<'_>) -> Option<&'static str> {
        if self.delegations != other.delegations {
            Some("delegations")
        } else if self.encryption_keys != other.encryption_keys {
            Some("encryptionKeys")
        } else if self.crypted_foreign_keys != other.crypted_foreign_keys {
            Some("cryptedForeignKeys")
        } else if self.secret_foreign_keys != other.secret_foreign_keys {
            Some("secretForeignKeys")
        } else if self.security_metadata != other.security_metadata {
            Some("securityMetadata")
        } else if self.merged_ids != other.merged_ids {
            Some("mergedIds")
        } else if self.deletion_date != other.deletion_date {
            Some("deletionDate")
        } else if self.merged_to_id != other.merged_to_id {
            Some("mergedToId")
        } else {
            None
        }
    }
}
