//! Smoke screen unit tests for formflow components
//!
//! These tests span the codebase and exercise public behavior in isolation from the service
//! scenarios. They are intended as a smoke screen and mostly test the happy path.

use std::sync::Arc;

use formflow::{
    actions::{Action, ActionKind, FieldAssignment, Jump, SetField},
    collaborators::{MemoryErrorLog, MemoryStore, RecordStore, ScriptedHttpClient},
    diff::diff,
    error::HistoryError,
    fields::{FieldDef, FieldKind, FormDef, Schema},
    record::Record,
    template::{Evaluator, Interpreter, Scope},
    types::{FixedClock, StatusId, TimeStamp},
    utils::new_uuid_to_bech32,
    value::{DataMap, Value},
    workflow::{Engine, Event, Outcome, Status, Workflow},
};

// UTILS MODULE TESTS
mod utils_tests {
    use super::*;

    /// Ids carry their human readable prefix
    #[test]
    fn generates_valid_bech32_with_hrp() {
        let encoded = new_uuid_to_bech32("record_").unwrap();
        assert!(encoded.starts_with("record_1"));
        assert!(encoded.len() > 10);
    }

    #[test]
    fn handles_empty_hrp() {
        assert!(new_uuid_to_bech32("").is_err());
    }
}

// TIMESTAMP TESTS
mod timestamp_tests {
    use super::*;

    #[test]
    fn iso_round_trip() {
        let at = TimeStamp::new_with(2024, 2, 29, 23, 59, 1).unwrap();
        assert_eq!(TimeStamp::parse_iso(&at.to_iso()).unwrap(), at);
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(
            TimeStamp::parse_iso("not a date"),
            Err(HistoryError::InvalidTimestampFormat("not a date".into()))
        );
    }

    #[test]
    fn invalid_calendar_date_is_none() {
        assert!(TimeStamp::new_with(2023, 2, 29, 0, 0, 0).is_none());
    }
}

// TEMPLATE TESTS
mod template_tests {
    use super::*;

    fn record() -> (Record, Schema) {
        let schema = Schema::new(vec![
            FieldDef::new("1", FieldKind::String).set_varname("email"),
            FieldDef::new("2", FieldKind::String).set_varname("amount"),
        ]);
        let mut data = DataMap::new();
        data.insert("1".into(), Value::from("jane@example.test"));
        data.insert("2".into(), Value::from("12"));
        let record = Record::create_with_id(
            "record_1".into(),
            "form",
            StatusId::from("new"),
            data,
            None,
            TimeStamp::new(),
        );
        (record, schema)
    }

    #[test]
    fn record_scope_exposes_fields_by_varname_and_id() {
        let (record, schema) = record();
        let scope = Scope::for_record(&record, &schema, Some("agent"));
        assert_eq!(scope.get("form_var_email"), &Value::from("jane@example.test"));
        assert_eq!(scope.get("form_f2"), &Value::from("12"));
        assert_eq!(scope.get("form_status"), &Value::from("new"));
        assert_eq!(scope.get("session_user"), &Value::from("agent"));
        assert_eq!(scope.get("form_var_missing"), &Value::Null);
    }

    #[test]
    fn conditions_compare_loosely() {
        let (record, schema) = record();
        let scope = Scope::for_record(&record, &schema, None);
        let interpreter = Interpreter;
        assert!(interpreter.evaluate_condition("form_var_amount == 12", &scope).unwrap());
        assert!(interpreter.evaluate_condition("{{ form_var_amount > 10 }}", &scope).unwrap());
        assert!(!interpreter.evaluate_condition("not form_var_email", &scope).unwrap());
    }

    #[test]
    fn rendering_mixes_text_and_values() {
        let (record, schema) = record();
        let scope = Scope::for_record(&record, &schema, None);
        let value = Interpreter
            .evaluate("Hello {{ form_var_email|upper }}", &scope)
            .unwrap();
        assert_eq!(value, Value::from("Hello JANE@EXAMPLE.TEST"));
    }
}

// DIFF TESTS
mod diff_tests {
    use super::*;

    #[test]
    fn display_lists_changes() {
        let schema = Schema::new(vec![FieldDef::new("1", FieldKind::String)]);
        let mut old = DataMap::new();
        old.insert("1".into(), Value::from("before"));
        let mut new = DataMap::new();
        new.insert("1".into(), Value::from("after"));

        let result = diff(&old, &new, &schema);
        assert_eq!(result.len(), 1);
        let table = result.to_string();
        assert!(table.starts_with("Field"));
        assert!(table.contains("before"));
        assert!(table.contains("after"));
    }
}

// ENGINE TESTS (in-memory collaborators)
mod engine_tests {
    use super::*;

    #[test]
    fn engine_runs_set_field_then_jumps() {
        let store = Arc::new(MemoryStore::new());
        let errors = Arc::new(MemoryErrorLog::new());
        let clock = Arc::new(FixedClock::new(TimeStamp::new()));
        let engine = Engine::new(store.clone(), Arc::new(ScriptedHttpClient::new()), errors.clone())
            .set_clock(clock);

        let formdef = FormDef::new(
            "form",
            "Form",
            "wf",
            vec![FieldDef::new("1", FieldKind::String).set_varname("state")],
        );
        let workflow = Workflow::new("wf", "Workflow", "new")
            .add_status(
                Status::new("new", "New")
                    .add_action(Action::new(
                        "_set",
                        ActionKind::SetField(SetField::new(vec![FieldAssignment::new("1", "checked")])),
                    ))
                    .add_action(
                        Action::new("_go", ActionKind::Jump(Jump::new("done")))
                            .set_condition("form_var_state == 'checked'"),
                    ),
            )
            .add_status(Status::new("done", "Done"));

        let mut record = Record::create(
            "form",
            workflow.initial_status.clone(),
            DataMap::new(),
            None,
            TimeStamp::new(),
        )
        .unwrap();
        let outcome = engine
            .advance(&mut record, &workflow, &formdef, Event::Created, None)
            .unwrap();

        assert_eq!(outcome, Outcome::Stable);
        assert_eq!(record.status, StatusId::from("done"));
        assert_eq!(record.data["1"], Value::from("checked"));
        assert!(errors.reports().is_empty());

        store.save_record(&record).unwrap();
        assert_eq!(store.load_record(&record.id).unwrap(), Some(record));
    }
}
