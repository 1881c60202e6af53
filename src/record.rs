//! The record (form or card instance) a workflow runs against
use crate::error::HistoryError;
use crate::evolution::{AnonymiseMode, EvolutionLog, Part, redact_data};
use crate::fields::Schema;
use crate::types::{StatusId, TimeStamp};
use crate::utils;
use crate::value::DataMap;

#[derive(Debug, PartialEq, minicbor::Encode, minicbor::Decode, Clone)]
pub struct Record {
    #[n(0)]
    pub id: String, // uuid7, use bech32
    #[n(1)]
    pub formdef_id: String,
    #[n(2)]
    pub data: DataMap,
    #[n(3)]
    pub status: StatusId,
    #[n(4)]
    pub evolution: EvolutionLog,
    #[n(5)]
    pub workflow_data: DataMap, // webservice results, linked record ids
    #[n(6)]
    pub receipt_time: TimeStamp,
    #[n(7)]
    pub user_id: Option<String>,
    #[n(8)]
    pub anonymised: Option<TimeStamp>,
}

impl Record {
    /// Creates a record with a fresh id and its creation snapshot (`{}` to `data`).
    pub fn create(
        formdef_id: &str,
        status: StatusId,
        data: DataMap,
        user_id: Option<&str>,
        now: TimeStamp,
    ) -> anyhow::Result<Self> {
        let id = utils::new_uuid_to_bech32("record_")?;
        Ok(Self::create_with_id(id, formdef_id, status, data, user_id, now))
    }

    pub fn create_with_id(
        id: String,
        formdef_id: &str,
        status: StatusId,
        data: DataMap,
        user_id: Option<&str>,
        now: TimeStamp,
    ) -> Self {
        let mut evolution = EvolutionLog::new();
        let part = evolution.snapshot_part(&DataMap::new(), &data, user_id, None, now);
        evolution.append_to_current_entry(part, &status, user_id);
        Self {
            id,
            formdef_id: formdef_id.to_string(),
            data,
            status,
            evolution,
            workflow_data: DataMap::new(),
            receipt_time: now,
            user_id: user_id.map(str::to_string),
            anonymised: None,
        }
    }

    /// Records the change from `old_data` to the current data in the current entry.
    ///
    /// Returns false when nothing changed. The data is then put back to `old_data` so it never
    /// drifts from what history replays (a null written over a missing key, a relabelled item).
    pub fn snapshot(
        &mut self,
        old_data: &DataMap,
        schema: &Schema,
        user_id: Option<&str>,
        action_id: Option<&str>,
        now: TimeStamp,
    ) -> bool {
        match self
            .evolution
            .record_change(old_data, &self.data, schema, user_id, action_id, now)
        {
            Some(part) => {
                self.evolution
                    .append_to_current_entry(part, &self.status, user_id);
                true
            }
            None => {
                self.data = old_data.clone();
                false
            }
        }
    }

    /// Snapshot for an edit: a change gets its own entry. An unchanged edit adds nothing,
    /// unless the last entry only holds metadata parts, in which case an empty entry is opened.
    pub fn snapshot_edit(
        &mut self,
        old_data: &DataMap,
        schema: &Schema,
        user_id: Option<&str>,
        action_id: Option<&str>,
        now: TimeStamp,
    ) -> bool {
        match self
            .evolution
            .record_change(old_data, &self.data, schema, user_id, action_id, now)
        {
            Some(part) => {
                self.evolution.open_entry(&self.status, user_id, now);
                self.evolution
                    .append_to_current_entry(part, &self.status, user_id);
                true
            }
            None => {
                self.data = old_data.clone();
                let closed_by_metadata = self
                    .evolution
                    .last_entry()
                    .is_some_and(|entry| !entry.parts.is_empty() && !entry.has_snapshot());
                if closed_by_metadata {
                    self.evolution.open_entry(&self.status, user_id, now);
                }
                false
            }
        }
    }

    /// Adds a metadata part (comment, link, error) to the current entry.
    pub fn add_part(&mut self, part: Part, user_id: Option<&str>) {
        self.evolution
            .append_to_current_entry(part, &self.status, user_id);
    }

    /// Moves to `to`, leaving a jump marker in the outgoing entry and opening one for `to`.
    pub fn jump_to(
        &mut self,
        to: StatusId,
        action_id: Option<&str>,
        user_id: Option<&str>,
        now: TimeStamp,
    ) {
        let part = Part::Jump {
            from: self.status.clone(),
            to: to.clone(),
            datetime: self.evolution.next_timestamp(now),
            action_id: action_id.map(str::to_string),
        };
        self.add_part(part, user_id);
        self.status = to;
        self.evolution.open_entry(&self.status, user_id, now);
    }

    pub fn last_update_time(&self) -> TimeStamp {
        self.evolution.last_time().unwrap_or(self.receipt_time)
    }

    pub fn data_at(&self, at: &str) -> Result<DataMap, HistoryError> {
        self.evolution.reconstruct_at_str(at)
    }

    pub fn anonymise(&mut self, schema: &Schema, mode: AnonymiseMode, now: TimeStamp) {
        redact_data(&mut self.data, schema, mode);
        self.evolution.anonymise(schema, mode);
        if mode == AnonymiseMode::Final {
            // webservice responses and linked ids may carry personal data too
            self.workflow_data.clear();
            self.user_id = None;
            self.anonymised = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn record_encoding() {
        let mut data = DataMap::new();
        data.insert("0".into(), Value::from("foo"));
        let original = Record::create("form", StatusId::from("new"), data, Some("user_1"), TimeStamp::new())
            .unwrap();

        let encoding = minicbor::to_vec(&original).unwrap();
        let decode: Record = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
    }

    #[test]
    fn jump_opens_entry_for_target() {
        let at = TimeStamp::new_with(2024, 1, 1, 12, 0, 0).unwrap();
        let mut record = Record::create_with_id(
            "r".into(),
            "form",
            StatusId::from("new"),
            DataMap::new(),
            None,
            at,
        );
        record.jump_to(StatusId::from("done"), Some("_jump"), None, at);
        assert_eq!(record.status, StatusId::from("done"));
        assert_eq!(record.evolution.entries.len(), 2);
        assert!(matches!(
            record.evolution.entries[0].parts.last(),
            Some(Part::Jump { .. })
        ));
        assert!(record.last_update_time() > at);
    }
}
