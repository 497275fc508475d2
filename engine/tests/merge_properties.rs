//! Property tests for the join used by the built-in merge capabilities.

use mend_engine::{fold_siblings, join_values, Delegation, EntityKind, JoinMerge, Record};
use proptest::prelude::*;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;

fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i32>().prop_map(|n| json!(n)),
        "[a-z]{0,4}".prop_map(Value::String),
        any::<bool>().prop_map(Value::Bool),
        Just(Value::Null),
    ]
}

fn item() -> impl Strategy<Value = Value> {
    (prop::sample::select(vec!["x", "y", "z"]), scalar())
        .prop_map(|(id, v)| json!({"id": id, "v": v}))
}

/// Arrays mixing keyed objects with plain values.
fn mixed_element() -> impl Strategy<Value = Value> {
    prop_oneof![item(), "[a-z]{1,2}".prop_map(Value::String), scalar()]
}

fn payload() -> impl Strategy<Value = Value> {
    (
        prop::collection::btree_map(prop::sample::select(vec!["a", "b", "c"]), scalar(), 0..3),
        prop::collection::vec(item(), 0..3),
        prop::collection::vec("[a-z]{1,2}", 0..3),
        prop::collection::vec(mixed_element(), 0..4),
    )
        .prop_map(|(fields, items, tags, entries)| {
            let mut object = Map::new();
            for (key, value) in fields {
                object.insert(key.to_string(), value);
            }
            object.insert("items".into(), Value::Array(items));
            object.insert("tags".into(), json!(tags));
            object.insert("entries".into(), Value::Array(entries));
            Value::Object(object)
        })
}

fn sibling(rev: &'static str) -> impl Strategy<Value = Record> {
    (
        payload(),
        prop::option::of(0u64..1000),
        prop::collection::btree_set(prop::sample::select(vec!["hcp-1", "hcp-2", "hcp-3"]), 0..3),
        prop::collection::btree_set("[a-f]{2}", 0..3),
    )
        .prop_map(move |(payload, modified, owners, foreign_keys)| {
            let mut record = Record::new("c-1", EntityKind::Contact, payload).with_rev(rev);
            record.modified = modified;
            for owner in owners {
                record.delegations.insert(
                    owner.to_string(),
                    BTreeSet::from([Delegation::new("hcp-1", owner, format!("key-{owner}"))]),
                );
            }
            record.secret_foreign_keys = foreign_keys;
            record
        })
}

const ORDERS: [[usize; 3]; 6] = [
    [0, 1, 2],
    [0, 2, 1],
    [1, 0, 2],
    [1, 2, 0],
    [2, 0, 1],
    [2, 1, 0],
];

proptest! {
    #[test]
    fn join_is_commutative(a in payload(), b in payload()) {
        prop_assert_eq!(join_values(&a, &b), join_values(&b, &a));
    }

    #[test]
    fn join_is_associative(a in payload(), b in payload(), c in payload()) {
        let left = join_values(&join_values(&a, &b), &c);
        let right = join_values(&a, &join_values(&b, &c));
        prop_assert_eq!(left, right);
    }

    #[test]
    fn fold_result_is_independent_of_sibling_order(
        kept in sibling("3-kept"),
        a in sibling("3-a"),
        b in sibling("2-b"),
        c in sibling("1-c"),
    ) {
        let siblings = [a, b, c];
        let (reference, _) = fold_siblings(&JoinMerge, kept.clone(), siblings.to_vec());

        for order in ORDERS {
            let reordered = order.iter().map(|&i| siblings[i].clone()).collect();
            let (folded, purgeable) = fold_siblings(&JoinMerge, kept.clone(), reordered);
            prop_assert_eq!(purgeable.len(), 3);
            prop_assert_eq!(&folded, &reference);
        }
        prop_assert_eq!(reference.rev.as_deref(), Some("3-kept"));
    }
}
