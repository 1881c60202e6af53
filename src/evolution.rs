//! Append-only record history and point-in-time replay
use std::collections::BTreeSet;

use crate::diff::diff;
use crate::error::HistoryError;
use crate::fields::{AnonymisePolicy, FieldDef, FieldKind, Schema};
use crate::types::{StatusId, TimeStamp};
use crate::value::{DataMap, Value};

/// Full before/after data of one mutation.
#[derive(Debug, PartialEq, minicbor::Encode, minicbor::Decode, Clone)]
pub struct ContentSnapshot {
    #[n(0)]
    pub old_data: DataMap,
    #[n(1)]
    pub new_data: DataMap,
    #[n(2)]
    pub datetime: TimeStamp,
    #[n(3)]
    pub user_id: Option<String>,
    #[n(4)]
    pub action_id: Option<String>, // none for submissions and direct edits
}

#[derive(Debug, PartialEq, minicbor::Encode, minicbor::Decode, Clone)]
pub enum Part {
    #[n(0)]
    ContentSnapshot(#[n(0)] ContentSnapshot),
    #[n(1)]
    Jump {
        #[n(0)]
        from: StatusId,
        #[n(1)]
        to: StatusId,
        #[n(2)]
        datetime: TimeStamp,
        #[n(3)]
        action_id: Option<String>,
    },
    #[n(2)]
    Comment {
        #[n(0)]
        text: String,
        #[n(1)]
        user_id: Option<String>,
        #[n(2)]
        datetime: TimeStamp,
    },
    #[n(3)]
    WsCallError {
        #[n(0)]
        label: String,
        #[n(1)]
        message: String,
        #[n(2)]
        datetime: TimeStamp,
    },
    #[n(4)]
    LinkedRecord {
        #[n(0)]
        formdef_id: String,
        #[n(1)]
        record_id: String,
        #[n(2)]
        datetime: TimeStamp,
    },
}

impl Part {
    pub fn datetime(&self) -> TimeStamp {
        match self {
            Part::ContentSnapshot(snapshot) => snapshot.datetime,
            Part::Jump { datetime, .. }
            | Part::Comment { datetime, .. }
            | Part::WsCallError { datetime, .. }
            | Part::LinkedRecord { datetime, .. } => *datetime,
        }
    }

    pub fn as_snapshot(&self) -> Option<&ContentSnapshot> {
        match self {
            Part::ContentSnapshot(snapshot) => Some(snapshot),
            _ => None,
        }
    }

    pub fn is_snapshot(&self) -> bool {
        self.as_snapshot().is_some()
    }

    /// Content hash and CBOR encoding of this part.
    pub fn build(&self) -> anyhow::Result<(String, Vec<u8>)> {
        let cbor = minicbor::to_vec(self)?;
        let hash = sha256::digest(&cbor);

        Ok((hash, cbor))
    }
}

/// One timeline node: the status that was active and what happened while in it.
#[derive(Debug, PartialEq, minicbor::Encode, minicbor::Decode, Clone)]
pub struct Evolution {
    #[n(0)]
    pub time: TimeStamp,
    #[n(1)]
    pub status: StatusId,
    #[n(2)]
    pub who: Option<String>,
    #[n(3)]
    pub parts: Vec<Part>,
}

impl Evolution {
    pub fn new(time: TimeStamp, status: StatusId, who: Option<String>) -> Self {
        Self {
            time,
            status,
            who,
            parts: vec![],
        }
    }

    pub fn has_snapshot(&self) -> bool {
        self.parts.iter().any(Part::is_snapshot)
    }
}

/// Which redaction pass to run over a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnonymiseMode {
    Intermediate,
    Final,
}

impl AnonymiseMode {
    fn redacts(&self, policy: AnonymisePolicy) -> bool {
        match self {
            AnonymiseMode::Intermediate => policy == AnonymisePolicy::Intermediate,
            AnonymiseMode::Final => policy != AnonymisePolicy::No,
        }
    }
}

#[derive(Debug, PartialEq, minicbor::Encode, minicbor::Decode, Clone, Default)]
#[cbor(transparent)]
pub struct EvolutionLog {
    #[n(0)]
    pub entries: Vec<Evolution>,
}

impl EvolutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_entry(&self) -> Option<&Evolution> {
        self.entries.last()
    }

    /// Most recent timestamp recorded anywhere in the log.
    pub fn last_time(&self) -> Option<TimeStamp> {
        self.entries
            .iter()
            .flat_map(|entry| {
                std::iter::once(entry.time).chain(entry.parts.iter().map(Part::datetime))
            })
            .max()
    }

    /// `now`, pushed past the last recorded timestamp when the clock has not moved.
    pub fn next_timestamp(&self, now: TimeStamp) -> TimeStamp {
        match self.last_time() {
            Some(last) if now <= last => last.successor(),
            _ => now,
        }
    }

    /// Builds a snapshot part for `old -> new`, or nothing when the data did not change.
    pub fn record_change(
        &self,
        old_data: &DataMap,
        new_data: &DataMap,
        schema: &Schema,
        user_id: Option<&str>,
        action_id: Option<&str>,
        now: TimeStamp,
    ) -> Option<Part> {
        if !diff(old_data, new_data, schema).has_changes() {
            return None;
        }
        Some(self.snapshot_part(old_data, new_data, user_id, action_id, now))
    }

    /// Snapshot part without no-op suppression (record creation).
    pub fn snapshot_part(
        &self,
        old_data: &DataMap,
        new_data: &DataMap,
        user_id: Option<&str>,
        action_id: Option<&str>,
        now: TimeStamp,
    ) -> Part {
        Part::ContentSnapshot(ContentSnapshot {
            old_data: old_data.clone(),
            new_data: new_data.clone(),
            datetime: self.next_timestamp(now),
            user_id: user_id.map(str::to_string),
            action_id: action_id.map(str::to_string),
        })
    }

    /// Adds `part` to the latest entry when it belongs to `status`, otherwise opens a new entry.
    pub fn append_to_current_entry(&mut self, part: Part, status: &StatusId, who: Option<&str>) {
        match self.entries.last_mut() {
            Some(entry) if entry.status == *status => entry.parts.push(part),
            _ => {
                let mut entry = Evolution::new(part.datetime(), status.clone(), who.map(str::to_string));
                entry.parts.push(part);
                self.entries.push(entry);
            }
        }
    }

    pub fn open_entry(&mut self, status: &StatusId, who: Option<&str>, now: TimeStamp) {
        let time = self.next_timestamp(now);
        self.entries
            .push(Evolution::new(time, status.clone(), who.map(str::to_string)));
    }

    /// Parts across every entry, oldest first. Each call starts over.
    pub fn iter_parts(&self) -> impl Iterator<Item = &Part> + Clone {
        self.entries.iter().flat_map(|entry| entry.parts.iter())
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &ContentSnapshot> + Clone {
        self.iter_parts().filter_map(Part::as_snapshot)
    }

    /// Data as it stood at `at`: the `new_data` of the last snapshot taken at or before it.
    pub fn reconstruct_at(&self, at: TimeStamp) -> Result<DataMap, HistoryError> {
        self.snapshots()
            .filter(|snapshot| snapshot.datetime <= at)
            .last()
            .map(|snapshot| snapshot.new_data.clone())
            .ok_or(HistoryError::NoDataFound)
    }

    pub fn reconstruct_at_str(&self, at: &str) -> Result<DataMap, HistoryError> {
        self.reconstruct_at(TimeStamp::parse_iso(at)?)
    }

    /// Checks that every snapshot starts from the data the previous one ended with.
    pub fn check_chain(&self) -> Result<(), HistoryError> {
        let snapshots: Vec<&ContentSnapshot> = self.snapshots().collect();
        for (index, pair) in snapshots.windows(2).enumerate() {
            if pair[0].new_data != pair[1].old_data {
                return Err(HistoryError::BrokenChain { index });
            }
        }
        Ok(())
    }

    /// Blob handles referenced by `current` or by any snapshot in the log.
    pub fn live_file_handles(&self, current: &DataMap) -> BTreeSet<String> {
        let mut handles = BTreeSet::new();
        current
            .values()
            .for_each(|value| value.collect_file_handles(&mut handles));
        for snapshot in self.snapshots() {
            snapshot
                .old_data
                .values()
                .chain(snapshot.new_data.values())
                .for_each(|value| value.collect_file_handles(&mut handles));
        }
        handles
    }

    /// Redacts history in place.
    ///
    /// Intermediate nulls matching fields in every snapshot and drops snapshots left without
    /// any change. Final discards every part and actor of every entry.
    pub fn anonymise(&mut self, schema: &Schema, mode: AnonymiseMode) {
        match mode {
            AnonymiseMode::Intermediate => {
                for entry in &mut self.entries {
                    for part in &mut entry.parts {
                        if let Part::ContentSnapshot(snapshot) = part {
                            redact_data(&mut snapshot.old_data, schema, mode);
                            redact_data(&mut snapshot.new_data, schema, mode);
                        }
                    }
                    entry.parts.retain(|part| match part {
                        Part::ContentSnapshot(snapshot) => {
                            snapshot.old_data != snapshot.new_data
                                || snapshot.old_data.is_empty()
                        }
                        _ => true,
                    });
                }
            }
            AnonymiseMode::Final => {
                for entry in &mut self.entries {
                    entry.parts.clear();
                    entry.who = None;
                }
            }
        }
    }
}

/// Nulls every value (and derived key) of fields `mode` redacts; block sub-fields row by row.
pub fn redact_data(data: &mut DataMap, schema: &Schema, mode: AnonymiseMode) {
    for field in schema.fields() {
        redact_field(data, field, mode);
    }
}

fn redact_field(data: &mut DataMap, field: &FieldDef, mode: AnonymiseMode) {
    if mode.redacts(field.anonymise) {
        for key in [field.id.clone(), field.display_key(), field.structured_key()] {
            if let Some(value) = data.get_mut(&key) {
                *value = Value::Null;
            }
        }
        return;
    }
    if field.kind != FieldKind::Block {
        return;
    }
    let (Some(block), Some(Value::Block(value))) = (&field.block, data.get_mut(&field.id)) else {
        return;
    };
    for row in &mut value.rows {
        for sub in &block.fields {
            redact_field(row, sub, mode);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(pairs: &[(&str, &str)]) -> DataMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::from(*v)))
            .collect()
    }

    fn schema() -> Schema {
        Schema::new(vec![
            FieldDef::new("0", FieldKind::String).set_anonymise(AnonymisePolicy::Intermediate),
            FieldDef::new("1", FieldKind::String).set_anonymise(AnonymisePolicy::No),
        ])
    }

    #[test]
    fn timestamps_are_strictly_increasing() {
        let at = TimeStamp::new_with(2024, 1, 1, 0, 0, 0).unwrap();
        let status = StatusId::from("new");
        let mut log = EvolutionLog::new();
        let first = log.snapshot_part(&DataMap::new(), &data(&[("0", "a")]), None, None, at);
        log.append_to_current_entry(first, &status, None);
        let second = log
            .record_change(&data(&[("0", "a")]), &data(&[("0", "b")]), &schema(), None, None, at)
            .unwrap();
        assert!(second.datetime() > at);
        log.append_to_current_entry(second, &status, None);
        assert_eq!(log.entries.len(), 1);
        assert!(log.check_chain().is_ok());
    }

    #[test]
    fn no_op_change_builds_no_part() {
        let log = EvolutionLog::new();
        let same = data(&[("0", "a")]);
        assert!(
            log.record_change(&same, &same, &schema(), None, None, TimeStamp::new())
                .is_none()
        );
    }

    #[test]
    fn new_status_opens_new_entry() {
        let at = TimeStamp::new_with(2024, 1, 1, 0, 0, 0).unwrap();
        let mut log = EvolutionLog::new();
        let part = log.snapshot_part(&DataMap::new(), &data(&[("0", "a")]), None, None, at);
        log.append_to_current_entry(part, &StatusId::from("new"), None);
        let part = Part::Comment {
            text: "hello".into(),
            user_id: None,
            datetime: log.next_timestamp(at),
        };
        log.append_to_current_entry(part, &StatusId::from("accepted"), None);
        assert_eq!(log.entries.len(), 2);
    }

    #[test]
    fn intermediate_anonymise_drops_parts_that_became_no_ops() {
        let at = TimeStamp::new_with(2024, 1, 1, 0, 0, 0).unwrap();
        let status = StatusId::from("new");
        let mut log = EvolutionLog::new();
        let first = log.snapshot_part(&DataMap::new(), &data(&[("0", "a"), ("1", "x")]), None, None, at);
        log.append_to_current_entry(first, &status, None);
        let second = log
            .record_change(
                &data(&[("0", "a"), ("1", "x")]),
                &data(&[("0", "b"), ("1", "x")]),
                &schema(),
                None,
                None,
                at,
            )
            .unwrap();
        log.append_to_current_entry(second, &status, None);

        log.anonymise(&schema(), AnonymiseMode::Intermediate);

        let snapshots: Vec<_> = log.snapshots().collect();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].new_data["0"], Value::Null);
        assert_eq!(snapshots[0].new_data["1"], Value::from("x"));
        assert!(log.check_chain().is_ok());
    }
}
