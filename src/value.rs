//! Dynamic values held in record data and history snapshots
use std::collections::{BTreeMap, BTreeSet};

use crate::fields::FieldKind;

/// Mapping from field id to value, the shape of `data`, `old_data` and `new_data`.
pub type DataMap = BTreeMap<String, Value>;

static NULL: Value = Value::Null;

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub enum Value {
    #[n(0)]
    Null,
    #[n(1)]
    Bool(#[n(0)] bool),
    #[n(2)]
    Int(#[n(0)] i64),
    #[n(3)]
    Float(#[n(0)] f64),
    #[n(4)]
    Str(#[n(0)] String),
    #[n(5)]
    Date(#[n(0)] DateValue),
    #[n(6)]
    File(#[n(0)] FileValue),
    #[n(7)]
    List(#[n(0)] Vec<Value>),
    #[n(8)]
    Map(#[n(0)] DataMap),
    #[n(9)]
    Block(#[n(0)] BlockValue),
}

/// Calendar date plus time components, stored split so it survives any timezone handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, minicbor::Encode, minicbor::Decode)]
pub struct DateValue {
    #[n(0)]
    pub year: i32,
    #[n(1)]
    pub month: u32,
    #[n(2)]
    pub day: u32,
    #[n(3)]
    pub hour: u32,
    #[n(4)]
    pub minute: u32,
    #[n(5)]
    pub second: u32,
}

/// Reference to an uploaded blob; the bytes live in the blob store.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct FileValue {
    #[n(0)]
    pub handle: String,
    #[n(1)]
    pub filename: String,
    #[n(2)]
    pub content_type: String,
    #[n(3)]
    pub digest: String, // sha256 of the content
}

/// Rows of a repeating block, with the sub-field kinds as declared when written.
#[derive(Debug, Clone, PartialEq, Default, minicbor::Encode, minicbor::Decode)]
pub struct BlockValue {
    #[n(0)]
    pub rows: Vec<DataMap>,
    #[n(1)]
    pub schema: BTreeMap<String, FieldKind>,
}

impl DateValue {
    pub fn from_ymd(year: i32, month: u32, day: u32) -> Self {
        Self {
            year,
            month,
            day,
            hour: 0,
            minute: 0,
            second: 0,
        }
    }
}

impl std::fmt::Display for DateValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)?;
        if (self.hour, self.minute, self.second) != (0, 0, 0) {
            write!(f, " {:02}:{:02}", self.hour, self.minute)?;
        }
        Ok(())
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Null, empty string, empty list and row-less block all count as "no value".
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Str(s) => s.is_empty(),
            Value::List(items) => items.is_empty(),
            Value::Map(map) => map.is_empty(),
            Value::Block(block) => block.rows.is_empty(),
            _ => false,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Date(_) | Value::File(_) => true,
            other => !other.is_empty(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&DataMap> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Human readable rendering used by history tables and text templates.
    pub fn to_display(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(true) => "True".into(),
            Value::Bool(false) => "False".into(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Str(s) => s.clone(),
            Value::Date(date) => date.to_string(),
            Value::File(file) => file.filename.clone(),
            Value::List(items) => items
                .iter()
                .map(Value::to_display)
                .collect::<Vec<_>>()
                .join(", "),
            Value::Map(_) => self.to_json().to_string(),
            Value::Block(block) => format!("{} row(s)", block.rows.len()),
        }
    }

    /// Dotted attribute lookup (`structured.more`, `rows.0`).
    pub fn get_path(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(map) => map.get(key),
            Value::List(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
    }

    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::{Map, Value as Json, json};
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => json!(i),
            Value::Float(f) => json!(f),
            Value::Str(s) => Json::String(s.clone()),
            Value::Date(date) => Json::String(date.to_string()),
            Value::File(file) => json!({
                "filename": file.filename,
                "content_type": file.content_type,
                "digest": file.digest,
            }),
            Value::List(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => Json::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect::<Map<_, _>>(),
            ),
            Value::Block(block) => Json::Array(
                block
                    .rows
                    .iter()
                    .map(|row| Value::Map(row.clone()).to_json())
                    .collect(),
            ),
        }
    }

    /// Collects every blob handle referenced by this value, recursing into containers.
    pub fn collect_file_handles(&self, out: &mut BTreeSet<String>) {
        match self {
            Value::File(file) => {
                out.insert(file.handle.clone());
            }
            Value::List(items) => items.iter().for_each(|v| v.collect_file_handles(out)),
            Value::Map(map) => map.values().for_each(|v| v.collect_file_handles(out)),
            Value::Block(block) => block
                .rows
                .iter()
                .flat_map(|row| row.values())
                .for_each(|v| v.collect_file_handles(out)),
            _ => {}
        }
    }
}

/// Missing keys read as null.
pub fn lookup<'a>(data: &'a DataMap, key: &str) -> &'a Value {
    data.get(key).unwrap_or(&NULL)
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<DataMap> for Value {
    fn from(value: DataMap) -> Self {
        Value::Map(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}
