//! Merge capabilities: the per-entity rules deciding whether two revisions of
//! a record can be combined, and how.
//!
//! The resolver only sees the [`MergeCapability`] trait. The implementations
//! here share one join over record content: object keys are merged
//! recursively, array elements carrying a string `id` are joined by that id
//! while the remaining elements are unioned as a set, and conflicting scalars are
//! settled by a total order over JSON values. The join is commutative and
//! associative, so folding siblings in any order converges on the same
//! content.

use crate::security::{join_security, union_delegations};
use crate::{EntityKind, Record};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Decides whether two revisions of a record can be merged, and merges them.
pub trait MergeCapability: Send + Sync {
    /// Whether `a` and `b` may be combined without losing information.
    fn can_merge(&self, a: &Record, b: &Record) -> bool;

    /// Combine `b` into `a`. The result keeps `a`'s id and revision.
    fn merge(&self, a: &Record, b: &Record) -> Record;
}

/// Always-mergeable capability backed by [`join_records`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JoinMerge;

impl MergeCapability for JoinMerge {
    fn can_merge(&self, a: &Record, b: &Record) -> bool {
        a.id == b.id && a.kind == b.kind
    }

    fn merge(&self, a: &Record, b: &Record) -> Record {
        join_records(a, b)
    }
}

/// Mergeable only when both revisions agree on a set of payload fields.
///
/// Used for records whose content refers to something that cannot be
/// combined, such as a binary attachment.
#[derive(Debug, Clone, Copy)]
pub struct MatchingFieldsMerge {
    fields: &'static [&'static str],
}

impl MatchingFieldsMerge {
    pub const fn new(fields: &'static [&'static str]) -> Self {
        Self { fields }
    }
}

impl MergeCapability for MatchingFieldsMerge {
    fn can_merge(&self, a: &Record, b: &Record) -> bool {
        JoinMerge.can_merge(a, b)
            && self
                .fields
                .iter()
                .all(|field| a.payload.get(field) == b.payload.get(field))
    }

    fn merge(&self, a: &Record, b: &Record) -> Record {
        join_records(a, b)
    }
}

const DOCUMENT_FIELDS: &[&str] = &["attachmentId", "mainUti"];
const FORM_FIELDS: &[&str] = &["formTemplateId"];

impl EntityKind {
    /// The merge rules for this kind of record.
    pub fn merge_capability(&self) -> Arc<dyn MergeCapability> {
        match self {
            EntityKind::Document => Arc::new(MatchingFieldsMerge::new(DOCUMENT_FIELDS)),
            EntityKind::Form => Arc::new(MatchingFieldsMerge::new(FORM_FIELDS)),
            EntityKind::Patient
            | EntityKind::Contact
            | EntityKind::Invoice
            | EntityKind::Message
            | EntityKind::HealthElement
            | EntityKind::CalendarItem
            | EntityKind::Classification
            | EntityKind::AccessLog => Arc::new(JoinMerge),
        }
    }
}

/// Join two revisions of the same record.
///
/// Identity (`id`, `rev`, `kind`, `conflicts`) comes from `a`; everything
/// else is combined symmetrically.
pub fn join_records(a: &Record, b: &Record) -> Record {
    Record {
        id: a.id.clone(),
        rev: a.rev.clone(),
        conflicts: a.conflicts.clone(),
        kind: a.kind,
        modified: a.modified.max(b.modified),
        deletion_date: a.deletion_date.max(b.deletion_date),
        merged_to_id: a.merged_to_id.clone().max(b.merged_to_id.clone()),
        merged_ids: a.merged_ids.union(&b.merged_ids).cloned().collect(),
        delegations: union_delegations(&a.delegations, &b.delegations),
        encryption_keys: union_delegations(&a.encryption_keys, &b.encryption_keys),
        crypted_foreign_keys: union_delegations(&a.crypted_foreign_keys, &b.crypted_foreign_keys),
        secret_foreign_keys: a
            .secret_foreign_keys
            .union(&b.secret_foreign_keys)
            .cloned()
            .collect(),
        security_metadata: join_security(a.security_metadata.as_ref(), b.security_metadata.as_ref()),
        payload: join_values(&a.payload, &b.payload),
    }
}

/// Join two JSON values.
pub fn join_values(a: &Value, b: &Value) -> Value {
    match (a, b) {
        (Value::Null, other) | (other, Value::Null) => other.clone(),
        (Value::Object(a), Value::Object(b)) => Value::Object(join_objects(a, b)),
        (Value::Array(a), Value::Array(b)) => Value::Array(join_arrays(a, b)),
        (a, b) => {
            if compare_values(a, b) == Ordering::Less {
                b.clone()
            } else {
                a.clone()
            }
        }
    }
}

fn join_objects(a: &Map<String, Value>, b: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = a.clone();
    for (key, value) in b {
        let joined = match merged.get(key) {
            Some(existing) => join_values(existing, value),
            None => value.clone(),
        };
        merged.insert(key.clone(), joined);
    }
    merged
}

fn element_id(value: &Value) -> Option<&str> {
    value.get("id").and_then(Value::as_str)
}

/// Elements carrying a string `id` are joined by that id, every other element
/// is unioned as a set. Plain elements come first, in value order, followed
/// by the keyed ones in id order.
fn join_arrays(a: &[Value], b: &[Value]) -> Vec<Value> {
    let mut plain: Vec<Value> = Vec::new();
    let mut by_id: BTreeMap<&str, Value> = BTreeMap::new();

    for value in a.iter().chain(b) {
        match element_id(value) {
            Some(id) => {
                let joined = match by_id.get(id) {
                    Some(existing) => join_values(existing, value),
                    None => value.clone(),
                };
                by_id.insert(id, joined);
            }
            None => plain.push(value.clone()),
        }
    }

    plain.sort_by(compare_values);
    plain.dedup();
    plain.extend(by_id.into_values());
    plain
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .zip(y.as_f64())
            .and_then(|(fx, fy)| fx.partial_cmp(&fy))
            .unwrap_or(Ordering::Equal)
            .then_with(|| x.to_string().cmp(&y.to_string())),
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            a.to_string().cmp(&b.to_string())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}
