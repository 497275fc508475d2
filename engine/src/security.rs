//! Sharing and access metadata carried by every record.
//!
//! The engine never interprets keys or data-owner hierarchies. It only
//! combines these structures when two revisions or two records are merged.

use crate::DataOwnerId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Per-owner map of delegation entries.
pub type DelegationMap = BTreeMap<DataOwnerId, BTreeSet<Delegation>>;

/// A legacy delegation entry granting a data owner access under a key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delegation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<DataOwnerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegated_to: Option<DataOwnerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl Delegation {
    pub fn new(
        owner: impl Into<DataOwnerId>,
        delegated_to: impl Into<DataOwnerId>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            owner: Some(owner.into()),
            delegated_to: Some(delegated_to.into()),
            key: Some(key.into()),
        }
    }
}

/// Access granted by a secure delegation.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccessLevel {
    #[default]
    Read,
    Write,
}

/// A delegation in the hashed secure-delegation scheme.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecureDelegation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegator: Option<DataOwnerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegate: Option<DataOwnerId>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub secret_ids: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub encryption_keys: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub owning_entity_ids: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub parent_delegations: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange_data_id: Option<String>,
    #[serde(default)]
    pub permissions: AccessLevel,
}

impl SecureDelegation {
    /// Combine two versions of the same delegation: sets are unioned and the
    /// stronger permission is kept.
    pub fn join(&self, other: &SecureDelegation) -> SecureDelegation {
        SecureDelegation {
            delegator: self.delegator.clone().max(other.delegator.clone()),
            delegate: self.delegate.clone().max(other.delegate.clone()),
            secret_ids: union(&self.secret_ids, &other.secret_ids),
            encryption_keys: union(&self.encryption_keys, &other.encryption_keys),
            owning_entity_ids: union(&self.owning_entity_ids, &other.owning_entity_ids),
            parent_delegations: union(&self.parent_delegations, &other.parent_delegations),
            exchange_data_id: self
                .exchange_data_id
                .clone()
                .max(other.exchange_data_id.clone()),
            permissions: self.permissions.max(other.permissions),
        }
    }
}

/// Secure delegations indexed by their access-control hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityMetadata {
    #[serde(default)]
    pub secure_delegations: BTreeMap<String, SecureDelegation>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub keys_equivalences: BTreeMap<String, String>,
}

impl SecurityMetadata {
    /// Symmetric combination used when folding replication siblings.
    ///
    /// Delegations present in both are joined entry by entry, so the result
    /// does not depend on argument order.
    pub fn join(&self, other: &SecurityMetadata) -> SecurityMetadata {
        let mut secure_delegations = self.secure_delegations.clone();
        for (hash, delegation) in &other.secure_delegations {
            secure_delegations
                .entry(hash.clone())
                .and_modify(|existing| *existing = existing.join(delegation))
                .or_insert_with(|| delegation.clone());
        }

        let mut keys_equivalences = self.keys_equivalences.clone();
        for (key, value) in &other.keys_equivalences {
            keys_equivalences
                .entry(key.clone())
                .and_modify(|existing| {
                    if value > existing {
                        *existing = value.clone();
                    }
                })
                .or_insert_with(|| value.clone());
        }

        SecurityMetadata {
            secure_delegations,
            keys_equivalences,
        }
    }

    /// Asymmetric combination used by duplicate merges: entries of `self`
    /// (the surviving record) win on overlapping keys.
    pub fn merge_preferring(&self, other: &SecurityMetadata) -> SecurityMetadata {
        let mut merged = self.clone();
        for (hash, delegation) in &other.secure_delegations {
            merged
                .secure_delegations
                .entry(hash.clone())
                .or_insert_with(|| delegation.clone());
        }
        for (key, value) in &other.keys_equivalences {
            merged
                .keys_equivalences
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        merged
    }
}

/// Join optional security metadata of two sibling revisions.
pub fn join_security(
    a: Option<&SecurityMetadata>,
    b: Option<&SecurityMetadata>,
) -> Option<SecurityMetadata> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.join(b)),
        (Some(only), None) | (None, Some(only)) => Some(only.clone()),
        (None, None) => None,
    }
}

/// Union two delegation maps: entries under the same owner are unioned,
/// never replaced.
pub fn union_delegations(a: &DelegationMap, b: &DelegationMap) -> DelegationMap {
    let mut merged = a.clone();
    for (owner, entries) in b {
        merged
            .entry(owner.clone())
            .or_default()
            .extend(entries.iter().cloned());
    }
    merged
}

fn union(a: &BTreeSet<String>, b: &BTreeSet<String>) -> BTreeSet<String> {
    a.union(b).cloned().collect()
}
