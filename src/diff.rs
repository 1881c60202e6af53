//! Structural difference between two data snapshots
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::fields::{FieldKind, Schema, kind_equals};
use crate::value::{DataMap, Value, lookup};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowChange {
    Added,
    Removed,
    Updated,
}

impl RowChange {
    fn label(&self) -> &'static str {
        match self {
            RowChange::Added => "added",
            RowChange::Removed => "removed",
            RowChange::Updated => "updated",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DiffEntry {
    /// A top level field id or a `block.sub.row` path.
    Field { path: String, old: Value, new: Value },
    Row {
        field_id: String,
        index: usize,
        change: RowChange,
    },
}

/// Ordered differences; row markers precede the sub-field changes of that row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DiffResult {
    pub entries: Vec<DiffEntry>,
}

impl DiffResult {
    pub fn has_changes(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value, &Value)> {
        self.entries.iter().filter_map(|entry| match entry {
            DiffEntry::Field { path, old, new } => Some((path.as_str(), old, new)),
            DiffEntry::Row { .. } => None,
        })
    }

    pub fn rows(&self) -> impl Iterator<Item = (&str, usize, RowChange)> {
        self.entries.iter().filter_map(|entry| match entry {
            DiffEntry::Row {
                field_id,
                index,
                change,
            } => Some((field_id.as_str(), *index, *change)),
            DiffEntry::Field { .. } => None,
        })
    }

    /// (old, new) pair reported for `path`, if any.
    pub fn get(&self, path: &str) -> Option<(&Value, &Value)> {
        self.fields()
            .find(|(p, _, _)| *p == path)
            .map(|(_, old, new)| (old, new))
    }

    fn push_field(&mut self, path: String, old: &Value, new: &Value) {
        self.entries.push(DiffEntry::Field {
            path,
            old: old.clone(),
            new: new.clone(),
        });
    }
}

/// Computes `old -> new` differences over the union of keys.
///
/// Missing keys read as null. `<id>_display`/`<id>_structured` only surface when `<id>` itself changed.
pub fn diff(old: &DataMap, new: &DataMap, schema: &Schema) -> DiffResult {
    let mut result = DiffResult::default();
    let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();

    for key in keys {
        let (a, b) = (lookup(old, key), lookup(new, key));

        if let Some(primary) = derived_primary(key, schema) {
            let kind = schema.kind_of(primary).unwrap_or(FieldKind::Computed);
            if kind_equals(kind, lookup(old, primary), lookup(new, primary)) {
                continue;
            }
            if a != b {
                result.push_field(key.clone(), a, b);
            }
            continue;
        }

        let kind = schema.kind_of(key);
        let is_block = kind == Some(FieldKind::Block)
            || matches!(a, Value::Block(_))
            || matches!(b, Value::Block(_));
        if is_block {
            diff_block(key, a, b, schema, &mut result);
        } else if !kind_equals(kind.unwrap_or(FieldKind::Computed), a, b) {
            result.push_field(key.clone(), a, b);
        }
    }
    result
}

fn derived_primary<'a>(key: &'a str, schema: &Schema) -> Option<&'a str> {
    let primary = key
        .strip_suffix("_display")
        .or_else(|| key.strip_suffix("_structured"))?;
    schema.get(primary).map(|_| primary)
}

fn diff_block(field_id: &str, old: &Value, new: &Value, schema: &Schema, out: &mut DiffResult) {
    let rows_of = |value: &Value| match value {
        Value::Block(block) => block.rows.clone(),
        _ => Vec::new(),
    };
    let (old_rows, new_rows) = (rows_of(old), rows_of(new));

    let mut sub_kinds: BTreeMap<String, FieldKind> = schema
        .get(field_id)
        .and_then(|f| f.block.as_ref())
        .map(|block| block.schema())
        .unwrap_or_default();
    for value in [old, new] {
        if let Value::Block(block) = value {
            for (sub, kind) in &block.schema {
                sub_kinds.entry(sub.clone()).or_insert(*kind);
            }
        }
    }

    let empty_row = DataMap::new();
    for index in 0..old_rows.len().max(new_rows.len()) {
        let change = if index >= old_rows.len() {
            RowChange::Added
        } else if index >= new_rows.len() {
            RowChange::Removed
        } else {
            RowChange::Updated
        };
        let row_a = old_rows.get(index).unwrap_or(&empty_row);
        let row_b = new_rows.get(index).unwrap_or(&empty_row);

        let mut sub_changes = vec![];
        let subs: BTreeSet<&String> = row_a.keys().chain(row_b.keys()).collect();
        for sub in subs {
            let kind = sub_kinds.get(sub).copied().unwrap_or(FieldKind::Computed);
            let (a, b) = (lookup(row_a, sub), lookup(row_b, sub));
            if !kind_equals(kind, a, b) {
                sub_changes.push((format!("{field_id}.{sub}.{index}"), a, b));
            }
        }

        if change == RowChange::Updated && sub_changes.is_empty() {
            continue;
        }
        out.entries.push(DiffEntry::Row {
            field_id: field_id.to_string(),
            index,
            change,
        });
        for (path, a, b) in sub_changes {
            out.push_field(path, a, b);
        }
    }
}

impl fmt::Display for DiffResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut lines: Vec<[String; 3]> = vec![[
            "Field".to_string(),
            "Old value".to_string(),
            "New value".to_string(),
        ]];
        for entry in &self.entries {
            lines.push(match entry {
                DiffEntry::Field { path, old, new } => {
                    [path.clone(), old.to_display(), new.to_display()]
                }
                DiffEntry::Row {
                    field_id,
                    index,
                    change,
                } => [
                    format!("{field_id}: element number {} ({})", index + 1, change.label()),
                    String::new(),
                    String::new(),
                ],
            });
        }
        let width = |col: usize| {
            lines
                .iter()
                .map(|line| line[col].chars().count())
                .max()
                .unwrap_or(0)
        };
        let (w0, w1) = (width(0), width(1));
        for line in &lines {
            writeln!(
                f,
                "{:<w0$} | {:<w1$} | {}",
                line[0],
                line[1],
                line[2],
                w0 = w0,
                w1 = w1
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{BlockDef, DataSource, DataSourceItem, FieldDef};
    use crate::value::BlockValue;

    fn schema() -> Schema {
        let block = BlockDef::new(
            "blk",
            "Block",
            vec![
                FieldDef::new("1", FieldKind::String),
                FieldDef::new("2", FieldKind::String),
            ],
        );
        Schema::new(vec![
            FieldDef::new("0", FieldKind::String),
            FieldDef::new("bo1", FieldKind::Item)
                .set_data_source(DataSource::new(vec![DataSourceItem::new("a", "aa")])),
            FieldDef::new("7", FieldKind::Block).set_block(block),
        ])
    }

    fn row(pairs: &[(&str, &str)]) -> DataMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::from(*v)))
            .collect()
    }

    fn block(rows: Vec<DataMap>) -> Value {
        Value::Block(BlockValue {
            rows,
            schema: BTreeMap::new(),
        })
    }

    #[test]
    fn null_and_absent_are_equal() {
        let old = DataMap::new();
        let mut new = DataMap::new();
        new.insert("0".into(), Value::Null);
        assert!(!diff(&old, &new, &schema()).has_changes());
    }

    #[test]
    fn derived_keys_follow_primary() {
        let mut old = DataMap::new();
        old.insert("bo1".into(), Value::from("a"));
        old.insert("bo1_display".into(), Value::from("aa"));
        let mut new = old.clone();
        new.insert("bo1_display".into(), Value::from("relabelled"));
        assert!(!diff(&old, &new, &schema()).has_changes());

        new.insert("bo1".into(), Value::from("b"));
        let result = diff(&old, &new, &schema());
        assert!(result.get("bo1").is_some());
        assert!(result.get("bo1_display").is_some());
    }

    #[test]
    fn block_rows_are_compared_by_index() {
        let mut old = DataMap::new();
        old.insert("7".into(), block(vec![row(&[("1", "a")]), row(&[("1", "b")])]));
        let mut new = DataMap::new();
        new.insert(
            "7".into(),
            block(vec![row(&[("1", "a")]), row(&[("1", "c")]), row(&[("2", "d")])]),
        );
        let result = diff(&old, &new, &schema());
        let rows: Vec<_> = result.rows().collect();
        assert_eq!(
            rows,
            vec![("7", 1, RowChange::Updated), ("7", 2, RowChange::Added)]
        );
        assert_eq!(
            result.get("7.1.1"),
            Some((&Value::from("b"), &Value::from("c")))
        );
        assert!(result.to_string().contains("element number 3 (added)"));
    }
}
