//! Property-based tests for snapshot differences
//!
//! These cover the invariants history relies on: a snapshot never differs from itself, a change
//! reported one way is reported the other way, and added rows mirror removed rows.

use proptest::prelude::*;
use formflow::diff::{RowChange, diff};
use formflow::fields::{BlockDef, FieldDef, FieldKind, Schema};
use formflow::value::{BlockValue, DataMap, Value};

fn schema() -> Schema {
    let block = BlockDef::new(
        "lines",
        "Lines",
        vec![
            FieldDef::new("1", FieldKind::String),
            FieldDef::new("2", FieldKind::String),
        ],
    );
    Schema::new(vec![
        FieldDef::new("a", FieldKind::String),
        FieldDef::new("b", FieldKind::Bool),
        FieldDef::new("c", FieldKind::Text),
        FieldDef::new("rows", FieldKind::Block).set_block(block),
    ])
}

fn scalar_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        "[a-z]{0,6}".prop_map(Value::Str),
        any::<bool>().prop_map(Value::Bool),
    ]
}

fn row_strategy() -> impl Strategy<Value = DataMap> {
    prop::collection::btree_map(
        prop_oneof![Just("1".to_string()), Just("2".to_string())],
        "[a-z]{1,4}".prop_map(Value::Str),
        0..=2,
    )
}

fn rows_strategy() -> impl Strategy<Value = Vec<DataMap>> {
    prop::collection::vec(row_strategy(), 0..4)
}

fn block(rows: Vec<DataMap>) -> Value {
    Value::Block(BlockValue {
        rows,
        schema: Default::default(),
    })
}

/// Data over the schema's top level keys, each key present or not.
fn data_strategy() -> impl Strategy<Value = DataMap> {
    (
        prop::option::of(scalar_strategy()),
        prop::option::of(scalar_strategy()),
        prop::option::of(scalar_strategy()),
        prop::option::of(rows_strategy()),
    )
        .prop_map(|(a, b, c, rows)| {
            let mut data = DataMap::new();
            for (key, value) in [("a", a), ("b", b), ("c", c)] {
                if let Some(value) = value {
                    data.insert(key.to_string(), value);
                }
            }
            if let Some(rows) = rows {
                data.insert("rows".to_string(), block(rows));
            }
            data
        })
}

proptest! {
    #[test]
    fn snapshot_never_differs_from_itself(data in data_strategy()) {
        prop_assert!(!diff(&data, &data, &schema()).has_changes());
    }

    #[test]
    fn changed_paths_are_symmetric(old in data_strategy(), new in data_strategy()) {
        let schema = schema();
        let forward = diff(&old, &new, &schema);
        let backward = diff(&new, &old, &schema);

        let mut forward_paths: Vec<&str> = forward.fields().map(|(path, _, _)| path).collect();
        let mut backward_paths: Vec<&str> = backward.fields().map(|(path, _, _)| path).collect();
        forward_paths.sort();
        backward_paths.sort();
        prop_assert_eq!(forward_paths, backward_paths);

        for (path, a, b) in forward.fields() {
            prop_assert_eq!(backward.get(path), Some((b, a)));
        }
    }

    #[test]
    fn added_rows_mirror_removed_rows(
        rows in rows_strategy(),
        extra in prop::collection::vec(row_strategy(), 1..3),
    ) {
        let schema = schema();
        let mut longer = rows.clone();
        longer.extend(extra.iter().filter(|row| !row.is_empty()).cloned());
        prop_assume!(longer.len() > rows.len());

        let mut old = DataMap::new();
        old.insert("rows".to_string(), block(rows.clone()));
        let mut new = DataMap::new();
        new.insert("rows".to_string(), block(longer.clone()));

        let added: Vec<usize> = diff(&old, &new, &schema)
            .rows()
            .filter(|(_, _, change)| *change == RowChange::Added)
            .map(|(_, index, _)| index)
            .collect();
        let removed: Vec<usize> = diff(&new, &old, &schema)
            .rows()
            .filter(|(_, _, change)| *change == RowChange::Removed)
            .map(|(_, index, _)| index)
            .collect();

        prop_assert_eq!(&added, &removed);
        prop_assert_eq!(added, (rows.len()..longer.len()).collect::<Vec<_>>());
    }
}

#[test]
fn null_and_missing_key_do_not_differ() {
    let mut with_null = DataMap::new();
    with_null.insert("a".into(), Value::Null);
    assert!(!diff(&with_null, &DataMap::new(), &schema()).has_changes());
}
