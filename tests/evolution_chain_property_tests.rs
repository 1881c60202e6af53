//! Property-based tests for the evolution log
//!
//! A record goes through random sequences of edits, jumps and comments, some of them at the
//! same clock instant. Whatever the sequence, the log must stay a chain that replays to the
//! current data.
//!
//! Not covered here: persistence (see scenarios) and anonymisation, which deliberately breaks
//! replay of redacted values.

use proptest::prelude::*;
use formflow::evolution::Part;
use formflow::fields::{FieldDef, FieldKind, Schema};
use formflow::record::Record;
use formflow::types::{StatusId, TimeStamp};
use formflow::value::{DataMap, Value};

#[derive(Debug, Clone)]
enum Step {
    /// Set field `a` (None clears it) in the current entry.
    Set(Option<String>),
    /// Same, recorded as a separate edit.
    Edit(Option<String>),
    /// Writes null into a key, which may not be there at all.
    Blank(&'static str),
    Jump(&'static str),
    Comment,
}

fn step_strategy() -> impl Strategy<Value = Step> {
    let value = prop::option::of("[a-c]{1,2}");
    prop_oneof![
        value.clone().prop_map(Step::Set),
        value.prop_map(Step::Edit),
        prop_oneof![Just("a"), Just("c")].prop_map(Step::Blank),
        prop_oneof![Just("new"), Just("review"), Just("done")].prop_map(Step::Jump),
        Just(Step::Comment),
    ]
}

fn schema() -> Schema {
    Schema::new(vec![
        FieldDef::new("a", FieldKind::String),
        FieldDef::new("b", FieldKind::String),
        FieldDef::new("c", FieldKind::String),
    ])
}

fn start() -> TimeStamp {
    TimeStamp::new_with(2024, 1, 1, 0, 0, 0).unwrap_or_default()
}

/// Replays `steps`, moving the clock by the paired number of seconds (zero keeps it still).
fn run(steps: &[(Step, i64)]) -> Record {
    let schema = schema();
    let mut now = start();
    let mut data = DataMap::new();
    data.insert("b".into(), Value::from("fixed"));
    let mut record = Record::create_with_id(
        "record_test".into(),
        "form",
        StatusId::from("new"),
        data,
        Some("user_1"),
        now,
    );

    for (step, secs) in steps {
        now = now.add_seconds(*secs);
        match step {
            Step::Set(value) | Step::Edit(value) => {
                let old = record.data.clone();
                match value {
                    Some(value) => record.data.insert("a".into(), Value::from(value.as_str())),
                    None => record.data.remove("a"),
                };
                if matches!(step, Step::Set(_)) {
                    record.snapshot(&old, &schema, None, Some("_set"), now);
                } else {
                    record.snapshot_edit(&old, &schema, Some("editor"), None, now);
                }
            }
            Step::Blank(key) => {
                let old = record.data.clone();
                record.data.insert(key.to_string(), Value::Null);
                record.snapshot(&old, &schema, None, Some("_blank"), now);
            }
            Step::Jump(target) => record.jump_to(StatusId::from(*target), Some("_jump"), None, now),
            Step::Comment => {
                let part = Part::Comment {
                    text: "noted".into(),
                    user_id: None,
                    datetime: record.evolution.next_timestamp(now),
                };
                record.add_part(part, None);
            }
        }
    }
    record
}

proptest! {
    #[test]
    fn snapshots_form_a_chain(steps in prop::collection::vec((step_strategy(), 0i64..3), 0..20)) {
        let record = run(&steps);
        prop_assert!(record.evolution.check_chain().is_ok());

        let first = record.evolution.snapshots().next().map(|s| s.old_data.clone());
        prop_assert_eq!(first, Some(DataMap::new()));
    }

    #[test]
    fn part_timestamps_strictly_increase(steps in prop::collection::vec((step_strategy(), 0i64..3), 0..20)) {
        let record = run(&steps);
        let times: Vec<TimeStamp> = record.evolution.iter_parts().map(Part::datetime).collect();
        for pair in times.windows(2) {
            prop_assert!(pair[0] < pair[1], "{:?} then {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn latest_replay_is_current_data(steps in prop::collection::vec((step_strategy(), 0i64..3), 0..20)) {
        let record = run(&steps);
        let at = record.last_update_time();
        let replayed = record.evolution.reconstruct_at(at)?;
        prop_assert_eq!(&replayed, &record.data);
    }

    #[test]
    fn every_snapshot_replays_at_its_own_time(steps in prop::collection::vec((step_strategy(), 0i64..3), 0..20)) {
        let record = run(&steps);
        for snapshot in record.evolution.snapshots() {
            let replayed = record.evolution.reconstruct_at(snapshot.datetime)?;
            prop_assert_eq!(&replayed, &snapshot.new_data);
        }
        let before = start().add_seconds(-1);
        prop_assert!(record.evolution.reconstruct_at(before).is_err());
    }

    #[test]
    fn log_survives_encoding(steps in prop::collection::vec((step_strategy(), 0i64..3), 0..12)) {
        let record = run(&steps);
        let encoding = minicbor::to_vec(&record)?;
        let decoded: Record = minicbor::decode(&encoding)?;
        prop_assert_eq!(decoded, record);
    }
}
