//! Field definitions and the per-kind value contract (validate, normalize, equals, set)
use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

use crate::error::{SetValueError, ValidationError};
use crate::value::{BlockValue, DataMap, DateValue, Value, lookup};

pub const DEFAULT_DATE_YEARS: RangeInclusive<i32> = 1800..=9999;

#[derive(
    minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum FieldKind {
    #[n(0)]
    String,
    #[n(1)]
    Text,
    #[n(2)]
    Bool,
    #[n(3)]
    Date,
    #[n(4)]
    Item,
    #[n(5)]
    Items,
    #[n(6)]
    File,
    #[n(7)]
    Block,
    #[n(8)]
    Computed,
    #[n(9)]
    Map,
}

impl FieldKind {
    pub fn label(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Text => "text",
            FieldKind::Bool => "bool",
            FieldKind::Date => "date",
            FieldKind::Item => "item",
            FieldKind::Items => "items",
            FieldKind::File => "file",
            FieldKind::Block => "block",
            FieldKind::Computed => "computed",
            FieldKind::Map => "map",
        }
    }
}

/// Whether a value survives redaction.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnonymisePolicy {
    #[n(0)]
    No,
    #[n(1)]
    Intermediate,
    #[n(2)]
    #[default]
    Final,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct DataSourceItem {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub text: String,
    #[n(2)]
    pub extra: DataMap,
}

/// Inline reference list an Item/Items field resolves against.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Default)]
pub struct DataSource {
    #[n(0)]
    pub items: Vec<DataSourceItem>,
}

impl DataSourceItem {
    pub fn new(id: &str, text: &str) -> Self {
        Self {
            id: id.to_string(),
            text: text.to_string(),
            extra: DataMap::new(),
        }
    }
    pub fn set_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
    /// Full entry as a map; null when the entry carries nothing beyond id and text.
    pub fn structured(&self) -> Value {
        if self.extra.is_empty() {
            return Value::Null;
        }
        let mut map = self.extra.clone();
        map.insert("id".into(), Value::Str(self.id.clone()));
        map.insert("text".into(), Value::Str(self.text.clone()));
        Value::Map(map)
    }
}

impl DataSource {
    pub fn new(items: Vec<DataSourceItem>) -> Self {
        Self { items }
    }
    /// Looks an entry up by id first, then by its label.
    pub fn find(&self, value: &str) -> Option<&DataSourceItem> {
        self.items
            .iter()
            .find(|item| item.id == value)
            .or_else(|| self.items.iter().find(|item| item.text == value))
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct BlockDef {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub fields: Vec<FieldDef>,
}

impl BlockDef {
    pub fn new(id: &str, name: &str, fields: Vec<FieldDef>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            fields,
        }
    }
    pub fn schema(&self) -> BTreeMap<String, FieldKind> {
        self.fields.iter().map(|f| (f.id.clone(), f.kind)).collect()
    }
    pub fn field(&self, id: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.id == id)
    }
}

/// How a block write lands on the current value.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockWrite {
    #[n(0)]
    #[default]
    Replace,
    #[n(1)]
    Append,
    /// Merge into the row at this index, `None` is the last row.
    #[n(2)]
    Merge(#[n(0)] Option<usize>),
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct FieldDef {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub kind: FieldKind,
    #[n(2)]
    pub label: String,
    #[n(3)]
    pub varname: Option<String>,
    #[n(4)]
    pub required: bool,
    #[n(5)]
    pub anonymise: AnonymisePolicy,
    #[n(6)]
    pub data_source: Option<DataSource>,
    #[n(7)]
    pub block: Option<BlockDef>,
}

impl FieldDef {
    pub fn new(id: &str, kind: FieldKind) -> Self {
        Self {
            id: id.to_string(),
            kind,
            label: id.to_string(),
            varname: None,
            required: false,
            anonymise: AnonymisePolicy::default(),
            data_source: None,
            block: None,
        }
    }
    pub fn set_label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }
    pub fn set_varname(mut self, varname: &str) -> Self {
        self.varname = Some(varname.to_string());
        self
    }
    pub fn set_required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }
    pub fn set_anonymise(mut self, policy: AnonymisePolicy) -> Self {
        self.anonymise = policy;
        self
    }
    pub fn set_data_source(mut self, source: DataSource) -> Self {
        self.data_source = Some(source);
        self
    }
    pub fn set_block(mut self, block: BlockDef) -> Self {
        self.block = Some(block);
        self
    }

    pub fn display_key(&self) -> String {
        format!("{}_display", self.id)
    }
    pub fn structured_key(&self) -> String {
        format!("{}_structured", self.id)
    }
    fn stores_derived_values(&self) -> bool {
        matches!(self.kind, FieldKind::Item | FieldKind::Items) && self.data_source.is_some()
    }

    fn invalid(&self, raw: &Value) -> ValidationError {
        ValidationError::InvalidValue {
            field_id: self.id.clone(),
            kind: self.kind.label(),
            value: raw.to_display(),
        }
    }

    pub fn validate(&self, raw: &Value) -> Result<Value, ValidationError> {
        self.validate_with_years(raw, DEFAULT_DATE_YEARS)
    }

    /// Converts a raw value (typically an evaluated expression) into this kind's value.
    pub fn validate_with_years(
        &self,
        raw: &Value,
        years: RangeInclusive<i32>,
    ) -> Result<Value, ValidationError> {
        if raw.is_null() || raw.as_str() == Some("") {
            return Ok(Value::Null);
        }
        match self.kind {
            FieldKind::String | FieldKind::Text => match raw {
                Value::Str(_) => Ok(raw.clone()),
                Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Date(_) => {
                    Ok(Value::Str(raw.to_display()))
                }
                _ => Err(self.invalid(raw)),
            },
            FieldKind::Bool => match raw {
                Value::Bool(_) => Ok(raw.clone()),
                Value::Int(i) => Ok(Value::Bool(*i != 0)),
                Value::Str(s) => match s.trim().to_lowercase().as_str() {
                    "true" | "on" | "yes" | "1" => Ok(Value::Bool(true)),
                    "false" | "off" | "no" | "0" => Ok(Value::Bool(false)),
                    _ => Err(self.invalid(raw)),
                },
                _ => Err(self.invalid(raw)),
            },
            FieldKind::Date => {
                let date = match raw {
                    Value::Date(date) => *date,
                    Value::Str(s) => parse_date(s.trim()).ok_or_else(|| self.invalid(raw))?,
                    _ => return Err(self.invalid(raw)),
                };
                if !years.contains(&date.year) {
                    return Err(ValidationError::DateOutOfRange {
                        field_id: self.id.clone(),
                        value: date.to_string(),
                    });
                }
                Ok(Value::Date(date))
            }
            FieldKind::Item => match raw {
                Value::Str(_) => Ok(raw.clone()),
                Value::Int(i) => Ok(Value::Str(i.to_string())),
                Value::Map(map) => match map.get("id") {
                    Some(id) if !id.is_empty() => Ok(Value::Str(id.to_display())),
                    _ => Err(self.invalid(raw)),
                },
                _ => Err(self.invalid(raw)),
            },
            FieldKind::Items => {
                let items: Vec<Value> = match raw {
                    Value::Str(s) => s
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(Value::from)
                        .collect(),
                    Value::List(items) => items
                        .iter()
                        .map(|item| match item {
                            Value::Str(_) => Ok(item.clone()),
                            Value::Int(i) => Ok(Value::Str(i.to_string())),
                            _ => Err(self.invalid(raw)),
                        })
                        .collect::<Result<_, _>>()?,
                    _ => return Err(self.invalid(raw)),
                };
                Ok(Value::List(items))
            }
            FieldKind::File => match raw {
                Value::File(_) => Ok(raw.clone()),
                _ => Err(self.invalid(raw)),
            },
            FieldKind::Block => match raw {
                Value::Block(_) => Ok(raw.clone()),
                _ => Err(self.invalid(raw)),
            },
            FieldKind::Map => match raw {
                Value::Map(_) => Ok(raw.clone()),
                Value::Str(s) => Ok(parse_coordinates(s).unwrap_or_else(|| raw.clone())),
                _ => Err(self.invalid(raw)),
            },
            FieldKind::Computed => Ok(raw.clone()),
        }
    }

    /// Canonical storable form: empty values collapse to null, blocks carry their schema.
    pub fn normalize_for_storage(&self, value: Value) -> Value {
        if value.is_empty() {
            return Value::Null;
        }
        match (self.kind, value) {
            (FieldKind::Block, Value::Block(mut block)) => {
                if block.schema.is_empty() {
                    if let Some(def) = &self.block {
                        block.schema = def.schema();
                    }
                }
                Value::Block(block)
            }
            (_, value) => value,
        }
    }

    pub fn equals(&self, a: &Value, b: &Value) -> bool {
        kind_equals(self.kind, a, b)
    }

    /// Writes an already validated value, maintaining `_display`/`_structured` for sourced items.
    ///
    /// On error `data` is left untouched.
    pub fn set_value(&self, data: &mut DataMap, value: Value) -> Result<(), SetValueError> {
        match self.kind {
            FieldKind::Item | FieldKind::Items if self.stores_derived_values() => {
                let (display, structured) = self.resolve(&value)?;
                data.insert(self.id.clone(), self.canonical_item_value(value));
                data.insert(self.display_key(), display);
                data.insert(self.structured_key(), structured);
            }
            FieldKind::Map => {
                if !value.is_null() && !is_coordinates(&value) {
                    return Err(SetValueError::InvalidCoordinates {
                        field_id: self.id.clone(),
                        value: value.to_display(),
                    });
                }
                data.insert(self.id.clone(), value);
            }
            FieldKind::Block => {
                if !matches!(value, Value::Null | Value::Block(_)) {
                    return Err(SetValueError::InvalidBlock(self.id.clone()));
                }
                data.insert(self.id.clone(), value);
            }
            _ => {
                data.insert(self.id.clone(), value);
            }
        }
        Ok(())
    }

    /// validate, normalize, then set.
    pub fn assign(
        &self,
        data: &mut DataMap,
        raw: &Value,
        years: RangeInclusive<i32>,
    ) -> Result<(), SetValueError> {
        let value = self.validate_with_years(raw, years)?;
        let value = self.normalize_for_storage(value);
        self.set_value(data, value)
    }

    // (display, structured) for a sourced item value
    fn resolve(&self, value: &Value) -> Result<(Value, Value), SetValueError> {
        let Some(source) = &self.data_source else {
            return Ok((Value::Null, Value::Null));
        };
        let not_found = |raw: &str| SetValueError::NoMatchingValue {
            field_id: self.id.clone(),
            value: raw.to_string(),
        };
        match value {
            Value::Null => Ok((Value::Null, Value::Null)),
            Value::List(items) => {
                let mut texts = vec![];
                let mut structured = vec![];
                for item in items {
                    let raw = item.to_display();
                    let entry = source.find(&raw).ok_or_else(|| not_found(&raw))?;
                    texts.push(entry.text.clone());
                    structured.push(entry.structured());
                }
                let structured = if structured.iter().all(Value::is_null) {
                    Value::Null
                } else {
                    Value::List(structured)
                };
                Ok((Value::Str(texts.join(", ")), structured))
            }
            other => {
                let raw = other.to_display();
                let entry = source.find(&raw).ok_or_else(|| not_found(&raw))?;
                Ok((Value::Str(entry.text.clone()), entry.structured()))
            }
        }
    }

    /// Maps labels to ids for sourced item values so the primary key always holds ids.
    pub fn canonical_item_value(&self, value: Value) -> Value {
        let Some(source) = self.data_source.as_ref().filter(|_| self.stores_derived_values())
        else {
            return value;
        };
        let to_id = |v: Value| match source.find(&v.to_display()) {
            Some(entry) => Value::Str(entry.id.clone()),
            None => v,
        };
        match value {
            Value::Null => Value::Null,
            Value::List(items) => Value::List(items.into_iter().map(to_id).collect()),
            other => to_id(other),
        }
    }

    /// Builds one block row from values keyed by sub-field id or varname and lands it per `mode`.
    ///
    /// Merging into a row that does not exist is ignored.
    pub fn write_block_row(
        &self,
        data: &mut DataMap,
        values: &DataMap,
        mode: BlockWrite,
        years: RangeInclusive<i32>,
    ) -> Result<(), SetValueError> {
        let Some(block) = &self.block else {
            return Err(SetValueError::InvalidBlock(self.id.clone()));
        };
        let mut row = DataMap::new();
        for sub in &block.fields {
            let raw = values.get(&sub.id).or_else(|| {
                sub.varname
                    .as_ref()
                    .and_then(|varname| values.get(varname.as_str()))
            });
            if let Some(raw) = raw {
                sub.assign(&mut row, raw, years.clone())?;
            }
        }

        let current = match lookup(data, &self.id) {
            Value::Block(current) => Some(current.clone()),
            _ => None,
        };
        let new_value = match (mode, current) {
            (BlockWrite::Append, Some(mut current)) => {
                current.rows.push(row);
                current
            }
            (BlockWrite::Merge(index), Some(mut current)) => {
                let index = match index {
                    Some(index) => index,
                    None => match current.rows.len().checked_sub(1) {
                        Some(last) => last,
                        None => return Ok(()),
                    },
                };
                let Some(existing) = current.rows.get_mut(index) else {
                    return Ok(());
                };
                existing.extend(row);
                current
            }
            (BlockWrite::Merge(_), None) => return Ok(()),
            _ => BlockValue {
                rows: vec![row],
                schema: block.schema(),
            },
        };
        data.insert(self.id.clone(), Value::Block(new_value));
        Ok(())
    }
}

/// Kind-aware equality, empty values are equal to each other whatever their shape.
pub fn kind_equals(kind: FieldKind, a: &Value, b: &Value) -> bool {
    if a.is_empty() && b.is_empty() {
        return true;
    }
    match (kind, a, b) {
        (_, Value::File(x), Value::File(y)) => x.digest == y.digest && x.filename == y.filename,
        (_, Value::Block(x), Value::Block(y)) => {
            x.rows.len() == y.rows.len()
                && x.rows.iter().zip(&y.rows).all(|(row_a, row_b)| {
                    rows_equal(row_a, row_b, |key| {
                        x.schema.get(key).or_else(|| y.schema.get(key)).copied()
                    })
                })
        }
        (_, Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            a.as_f64() == b.as_f64()
        }
        _ => a == b,
    }
}

fn rows_equal(a: &DataMap, b: &DataMap, kind_of: impl Fn(&str) -> Option<FieldKind>) -> bool {
    a.keys().chain(b.keys()).all(|key| {
        let kind = kind_of(key).unwrap_or(FieldKind::Computed);
        kind_equals(kind, lookup(a, key), lookup(b, key))
    })
}

fn parse_date(s: &str) -> Option<DateValue> {
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M", "%d/%m/%Y %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(DateValue {
                year: dt.year(),
                month: dt.month(),
                day: dt.day(),
                hour: dt.hour(),
                minute: dt.minute(),
                second: dt.second(),
            });
        }
    }
    ["%Y-%m-%d", "%d/%m/%Y"]
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(s, format).ok())
        .map(|d| DateValue::from_ymd(d.year(), d.month(), d.day()))
}

fn parse_coordinates(s: &str) -> Option<Value> {
    let (lat, lon) = s.split_once(';')?;
    let lat: f64 = lat.trim().parse().ok()?;
    let lon: f64 = lon.trim().parse().ok()?;
    let mut map = DataMap::new();
    map.insert("lat".into(), Value::Float(lat));
    map.insert("lon".into(), Value::Float(lon));
    Some(Value::Map(map))
}

fn is_coordinates(value: &Value) -> bool {
    let Some(map) = value.as_map() else {
        return false;
    };
    let in_range = |key: &str, bound: f64| {
        lookup(map, key)
            .as_f64()
            .is_some_and(|v| v.is_finite() && v.abs() <= bound)
    };
    in_range("lat", 90.0) && in_range("lon", 180.0)
}

/// A form or card definition: the record-side half of a schema.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct FormDef {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub workflow_id: String,
    #[n(3)]
    pub fields: Vec<FieldDef>,
}

impl FormDef {
    pub fn new(id: &str, name: &str, workflow_id: &str, fields: Vec<FieldDef>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            workflow_id: workflow_id.to_string(),
            fields,
        }
    }

    /// Required fields that hold no value in `data`.
    pub fn missing_required(&self, data: &DataMap) -> Vec<ValidationError> {
        self.fields
            .iter()
            .filter(|f| f.required && lookup(data, &f.id).is_empty())
            .map(|f| ValidationError::Required(f.id.clone()))
            .collect()
    }
}

/// Immutable field lookup for one evaluation: form fields followed by workflow backoffice fields.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: Vec<FieldDef>,
}

impl Schema {
    pub fn new(fields: Vec<FieldDef>) -> Self {
        Self { fields }
    }
    pub fn combined(form: &[FieldDef], backoffice: &[FieldDef]) -> Self {
        Self {
            fields: form.iter().chain(backoffice).cloned().collect(),
        }
    }
    pub fn get(&self, id: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.id == id)
    }
    pub fn by_varname(&self, varname: &str) -> Option<&FieldDef> {
        self.fields
            .iter()
            .find(|f| f.varname.as_deref() == Some(varname))
    }
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }
    pub fn kind_of(&self, key: &str) -> Option<FieldKind> {
        self.get(key).map(|f| f.kind)
    }
}
