//! Service layer API for record workflow operations
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::{Context, anyhow};
use sled::{Db, Tree};
use tracing::{info, warn};

use crate::collaborators::{ErrorSink, HttpClient, RecordStore};
use crate::config::EngineConfig;
use crate::evolution::AnonymiseMode;
use crate::fields::{FormDef, Schema};
use crate::record::Record;
use crate::types::Clock;
use crate::value::{DataMap, Value};
use crate::workflow::{Engine, Event, Outcome, Workflow};

/// Records, workflows and form definitions as CBOR values in three sled trees.
pub struct SledStore {
    records: Tree,
    workflows: Tree,
    formdefs: Tree,
}

impl SledStore {
    pub fn new(instance: &Db) -> anyhow::Result<Self> {
        Ok(Self {
            records: instance.open_tree("records")?,
            workflows: instance.open_tree("workflows")?,
            formdefs: instance.open_tree("formdefs")?,
        })
    }

    pub fn record_ids(&self) -> anyhow::Result<Vec<String>> {
        self.records
            .iter()
            .keys()
            .map(|key| -> anyhow::Result<String> { Ok(String::from_utf8(key?.to_vec())?) })
            .collect()
    }
}

fn load<T: for<'b> minicbor::Decode<'b, ()>>(tree: &Tree, id: &str) -> anyhow::Result<Option<T>> {
    match tree.get(id.as_bytes())? {
        Some(bytes) => Ok(Some(
            minicbor::decode(&bytes).with_context(|| format!("corrupt entry {id}"))?,
        )),
        None => Ok(None),
    }
}

impl RecordStore for SledStore {
    fn load_record(&self, id: &str) -> anyhow::Result<Option<Record>> {
        load(&self.records, id)
    }
    fn save_record(&self, record: &Record) -> anyhow::Result<()> {
        self.records
            .insert(record.id.as_bytes(), minicbor::to_vec(record)?)?;
        Ok(())
    }
    fn load_workflow(&self, id: &str) -> anyhow::Result<Option<Workflow>> {
        load(&self.workflows, id)
    }
    fn save_workflow(&self, workflow: &Workflow) -> anyhow::Result<()> {
        self.workflows
            .insert(workflow.id.as_bytes(), minicbor::to_vec(workflow)?)?;
        Ok(())
    }
    fn load_formdef(&self, id: &str) -> anyhow::Result<Option<FormDef>> {
        load(&self.formdefs, id)
    }
    fn save_formdef(&self, formdef: &FormDef) -> anyhow::Result<()> {
        self.formdefs
            .insert(formdef.id.as_bytes(), minicbor::to_vec(formdef)?)?;
        Ok(())
    }
}

pub struct WorkflowService {
    instance: Arc<sled::Db>,
    store: Arc<SledStore>,
    engine: Engine,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl WorkflowService {
    pub fn new(
        instance: Arc<sled::Db>,
        http: Arc<dyn HttpClient>,
        errors: Arc<dyn ErrorSink>,
    ) -> anyhow::Result<Self> {
        let store = Arc::new(SledStore::new(&instance)?);
        let engine = Engine::new(store.clone(), http, errors);
        Ok(Self {
            instance,
            store,
            engine,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn set_config(mut self, config: EngineConfig) -> Self {
        self.engine = self.engine.set_config(config);
        self
    }

    pub fn set_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.engine = self.engine.set_clock(clock);
        self
    }

    pub fn store(&self) -> &SledStore {
        &self.store
    }

    // calls on the same record run one at a time; the entry goes once nobody waits on it
    fn locked<T>(&self, record_id: &str, f: impl FnOnce() -> T) -> T {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(record_id.to_string()).or_default().clone()
        };
        let result = {
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            f()
        };
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // held by the map and this call only
        if Arc::strong_count(&lock) == 2 {
            locks.remove(record_id);
        }
        result
    }

    fn definitions(&self, formdef_id: &str) -> anyhow::Result<(FormDef, Workflow)> {
        let formdef = self
            .store
            .load_formdef(formdef_id)?
            .ok_or_else(|| anyhow!("unknown form definition {formdef_id}"))?;
        let workflow = self
            .store
            .load_workflow(&formdef.workflow_id)?
            .ok_or_else(|| anyhow!("unknown workflow {}", formdef.workflow_id))?;
        Ok((formdef, workflow))
    }

    /// Saves a workflow and a form definition using it, refusing broken graphs.
    pub fn install(&self, formdef: &FormDef, workflow: &Workflow) -> anyhow::Result<()> {
        if let Err(problems) = workflow.validate() {
            let problems: Vec<String> = problems.iter().map(ToString::to_string).collect();
            return Err(anyhow!(
                "workflow {} is invalid: {}",
                workflow.id,
                problems.join("; ")
            ));
        }
        self.store.save_workflow(workflow)?;
        self.store.save_formdef(formdef)?;
        self.instance.flush()?;
        Ok(())
    }

    pub fn load(&self, record_id: &str) -> anyhow::Result<Record> {
        self.store
            .load_record(record_id)?
            .ok_or_else(|| anyhow!("unknown record {record_id}"))
    }

    /// Validates submitted values, creates the record and runs its initial status.
    pub fn submit(
        &self,
        formdef_id: &str,
        submitted: DataMap,
        user_id: Option<&str>,
    ) -> anyhow::Result<(Record, Outcome)> {
        let (formdef, workflow) = self.definitions(formdef_id)?;
        let years = self.engine.config().date_years();

        let mut data = DataMap::new();
        for field in &formdef.fields {
            let raw = submitted.get(&field.id).cloned().unwrap_or(Value::Null);
            field
                .assign(&mut data, &raw, years.clone())
                .with_context(|| format!("invalid value for field {}", field.id))?;
        }
        if let Some(missing) = formdef.missing_required(&data).into_iter().next() {
            return Err(missing.into());
        }

        let now = self.engine.clock().now();
        let mut record = Record::create(
            &formdef.id,
            workflow.initial_status.clone(),
            data,
            user_id,
            now,
        )?;
        let record_id = record.id.clone();
        self.locked(&record_id, || -> anyhow::Result<(Record, Outcome)> {
            let result = self
                .engine
                .advance(&mut record, &workflow, &formdef, Event::Created, user_id);
            self.store.save_record(&record)?;
            info!(record_id = %record.id, formdef_id, status = %record.status, "record submitted");
            let outcome = result.with_context(|| format!("advancing record {}", record.id))?;
            Ok((record, outcome))
        })
    }

    fn run(
        &self,
        record_id: &str,
        event: Event,
        user_id: Option<&str>,
    ) -> anyhow::Result<(Record, Outcome)> {
        self.locked(record_id, || -> anyhow::Result<(Record, Outcome)> {
            let mut record = self.load(record_id)?;
            let (formdef, workflow) = self.definitions(&record.formdef_id)?;
            let result = self
                .engine
                .advance(&mut record, &workflow, &formdef, event, user_id);
            self.store.save_record(&record)?;
            let outcome = result.with_context(|| format!("advancing record {record_id}"))?;
            Ok((record, outcome))
        })
    }

    /// A human pressed a choice button.
    pub fn click_button(
        &self,
        record_id: &str,
        action_id: &str,
        user_id: Option<&str>,
    ) -> anyhow::Result<(Record, Outcome)> {
        self.run(record_id, Event::Button(action_id.to_string()), user_id)
    }

    /// A human edit through the editable action `action_id`; only changed records are saved.
    pub fn edit(
        &self,
        record_id: &str,
        action_id: &str,
        changes: &DataMap,
        user_id: Option<&str>,
    ) -> anyhow::Result<Record> {
        self.locked(record_id, || -> anyhow::Result<Record> {
            let mut record = self.load(record_id)?;
            let (formdef, workflow) = self.definitions(&record.formdef_id)?;
            let entries = record.evolution.entries.len();
            let changed = self
                .engine
                .edit(&mut record, &workflow, &formdef, action_id, changes, user_id)
                .with_context(|| format!("editing record {record_id}"))?;
            if changed || record.evolution.entries.len() != entries {
                self.store.save_record(&record)?;
            }
            Ok(record)
        })
    }

    /// An external system fired a named trigger.
    pub fn trigger(&self, record_id: &str, name: &str) -> anyhow::Result<(Record, Outcome)> {
        self.run(record_id, Event::Callback(name.to_string()), None)
    }

    /// Evaluates timeout jumps of every record; returns how many records moved.
    pub fn apply_timeouts(&self) -> anyhow::Result<usize> {
        let mut moved = 0;
        for record_id in self.store.record_ids()? {
            let before = self.load(&record_id)?.status;
            match self.run(&record_id, Event::Timer, None) {
                Ok((record, _)) if record.status != before => moved += 1,
                Ok(_) => {}
                Err(error) => warn!(record_id = %record_id, error = %error, "timeout evaluation failed"),
            }
        }
        Ok(moved)
    }

    /// Data of a record as it stood at an ISO-8601 datetime.
    pub fn data_at(&self, record_id: &str, at: &str) -> anyhow::Result<DataMap> {
        let record = self.load(record_id)?;
        Ok(record.data_at(at)?)
    }

    pub fn anonymise(&self, record_id: &str, mode: AnonymiseMode) -> anyhow::Result<Record> {
        self.locked(record_id, || -> anyhow::Result<Record> {
            let mut record = self.load(record_id)?;
            let (formdef, workflow) = self.definitions(&record.formdef_id)?;
            let schema = Schema::combined(&formdef.fields, &workflow.backoffice_fields);
            record.anonymise(&schema, mode, self.engine.clock().now());
            self.store.save_record(&record)?;
            info!(record_id, ?mode, "record anonymised");
            Ok(record)
        })
    }

    /// Records whose current status is visible to `user_id`. Records in an unknown status are
    /// left out.
    pub fn records_visible_to(&self, user_id: Option<&str>) -> anyhow::Result<Vec<Record>> {
        let mut workflows: HashMap<String, Workflow> = HashMap::new();
        let mut visible = vec![];
        for record_id in self.store.record_ids()? {
            let record = self.load(&record_id)?;
            if !workflows.contains_key(&record.formdef_id) {
                let (_, workflow) = self.definitions(&record.formdef_id)?;
                workflows.insert(record.formdef_id.clone(), workflow);
            }
            let shown = workflows
                .get(&record.formdef_id)
                .and_then(|workflow| workflow.status(&record.status))
                .is_some_and(|status| status.visible_to(&record, user_id));
            if shown {
                visible.push(record);
            }
        }
        Ok(visible)
    }

    /// Every blob handle still referenced by a record or its history.
    pub fn live_file_handles(&self) -> anyhow::Result<BTreeSet<String>> {
        let mut handles = BTreeSet::new();
        for record_id in self.store.record_ids()? {
            let record = self.load(&record_id)?;
            handles.extend(record.evolution.live_file_handles(&record.data));
        }
        Ok(handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{MemoryErrorLog, ScriptedHttpClient};
    use crate::fields::{FieldDef, FieldKind};
    use crate::workflow::Status;

    #[test]
    fn record_locks_are_released() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = Arc::new(sled::open(dir.path().join("locks.db"))?);
        let service = WorkflowService::new(
            db,
            Arc::new(ScriptedHttpClient::new()),
            Arc::new(MemoryErrorLog::new()),
        )?;
        let formdef = FormDef::new("form", "Form", "wf", vec![FieldDef::new("1", FieldKind::String)]);
        let workflow = Workflow::new("wf", "Plain", "new").add_status(Status::new("new", "New"));
        service.install(&formdef, &workflow)?;

        let (record, _) = service.submit("form", DataMap::new(), None)?;
        service.apply_timeouts()?;
        service.anonymise(&record.id, AnonymiseMode::Intermediate)?;

        let locks = service.locks.lock().unwrap_or_else(|e| e.into_inner());
        assert!(locks.is_empty());
        Ok(())
    }
}
