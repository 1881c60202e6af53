use tracing::{info, warn};

use super::{ActionContext, FieldAssignment, Signal, apply_assignments};
use crate::error::ActionError;
use crate::evolution::Part;
use crate::fields::{BlockWrite, FormDef, Schema};
use crate::record::Record;
use crate::value::{DataMap, Value};
use crate::workflow::{Event, Workflow};

/// Creates a record of another definition and runs its workflow from the initial status.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct CreateRecord {
    #[n(0)]
    pub formdef_id: String,
    #[n(1)]
    pub mappings: Vec<FieldAssignment>,
    #[n(2)]
    pub map_fields_by_varname: bool,
    /// Stores the new record id as `<varname>_id` in workflow data.
    #[n(3)]
    pub varname: Option<String>,
}

/// Updates fields of an existing record, found by an evaluated id.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct EditRecord {
    #[n(0)]
    pub target_id: String,
    #[n(1)]
    pub mappings: Vec<FieldAssignment>,
    #[n(2)]
    pub block_mode: BlockWrite,
}

fn load_definitions(ctx: &ActionContext<'_>, formdef_id: &str) -> Result<(FormDef, Workflow), ActionError> {
    let store = ctx.engine.store();
    let formdef = store
        .load_formdef(formdef_id)
        .map_err(ActionError::Storage)?
        .ok_or_else(|| ActionError::MissingDefinition(formdef_id.to_string()))?;
    let workflow = store
        .load_workflow(&formdef.workflow_id)
        .map_err(ActionError::Storage)?
        .ok_or_else(|| ActionError::MissingDefinition(formdef.workflow_id.clone()))?;
    Ok((formdef, workflow))
}

impl CreateRecord {
    pub fn new(formdef_id: &str, mappings: Vec<FieldAssignment>) -> Self {
        Self {
            formdef_id: formdef_id.to_string(),
            mappings,
            map_fields_by_varname: false,
            varname: None,
        }
    }

    pub fn set_map_fields_by_varname(mut self, enabled: bool) -> Self {
        self.map_fields_by_varname = enabled;
        self
    }

    pub fn set_varname(mut self, varname: &str) -> Self {
        self.varname = Some(varname.to_string());
        self
    }

    // copies values (and derived keys) between fields sharing a varname
    fn map_by_varname(&self, source: &Record, source_schema: &Schema, target: &FormDef) -> DataMap {
        let mut data = DataMap::new();
        for field in &target.fields {
            let Some(source_field) = field
                .varname
                .as_deref()
                .and_then(|varname| source_schema.by_varname(varname))
            else {
                continue;
            };
            let pairs = [
                (source_field.id.clone(), field.id.clone()),
                (source_field.display_key(), field.display_key()),
                (source_field.structured_key(), field.structured_key()),
            ];
            for (from, to) in pairs {
                if let Some(value) = source.data.get(&from) {
                    data.insert(to, value.clone());
                }
            }
        }
        data
    }

    pub(super) fn perform(
        &self,
        action_id: &str,
        record: &mut Record,
        ctx: &mut ActionContext<'_>,
    ) -> Result<Signal, ActionError> {
        let depth = ctx.creations.iter().filter(|id| *id == action_id).count();
        if depth >= ctx.engine.config().create_recursion_limit {
            warn!(record_id = %record.id, action_id, depth, "record creation recursion limit reached");
            return Ok(Signal::Continue);
        }

        let (formdef, workflow) = load_definitions(ctx, &self.formdef_id)?;
        let target_schema = Schema::combined(&formdef.fields, &workflow.backoffice_fields);

        let mut data = if self.map_fields_by_varname {
            self.map_by_varname(record, ctx.schema, &formdef)
        } else {
            DataMap::new()
        };
        let scope = ctx.scope(record);
        apply_assignments(
            ctx,
            &scope,
            &record.id,
            action_id,
            &target_schema,
            &formdef.id,
            &mut data,
            &self.mappings,
            BlockWrite::Replace,
        )?;

        let now = ctx.now();
        let mut created = Record::create(
            &formdef.id,
            workflow.initial_status.clone(),
            data,
            ctx.actor,
            now,
        )
        .map_err(ActionError::Storage)?;

        ctx.creations.push(action_id.to_string());
        let advanced = ctx.engine.advance_nested(
            &mut created,
            &workflow,
            &target_schema,
            Event::Created,
            ctx.actor,
            ctx.creations,
        );
        ctx.creations.pop();
        if let Err(error) = advanced {
            warn!(record_id = %created.id, error = %error, "created record stopped advancing");
        }

        ctx.engine
            .store()
            .save_record(&created)
            .map_err(ActionError::Storage)?;

        let part = Part::LinkedRecord {
            formdef_id: formdef.id.clone(),
            record_id: created.id.clone(),
            datetime: record.evolution.next_timestamp(ctx.now()),
        };
        record.add_part(part, ctx.actor);
        if let Some(varname) = &self.varname {
            record
                .workflow_data
                .insert(format!("{varname}_id"), Value::Str(created.id.clone()));
        }
        info!(record_id = %record.id, created_id = %created.id, formdef_id = %formdef.id, "linked record created");
        Ok(Signal::Continue)
    }
}

impl EditRecord {
    pub fn new(target_id: &str, mappings: Vec<FieldAssignment>) -> Self {
        Self {
            target_id: target_id.to_string(),
            mappings,
            block_mode: BlockWrite::Replace,
        }
    }

    pub fn set_block_mode(mut self, mode: BlockWrite) -> Self {
        self.block_mode = mode;
        self
    }

    pub(super) fn perform(
        &self,
        action_id: &str,
        record: &mut Record,
        ctx: &mut ActionContext<'_>,
    ) -> Result<Signal, ActionError> {
        let scope = ctx.scope(record);
        let target_id = ctx.evaluate(&self.target_id, &scope)?.to_display();
        if target_id.is_empty() {
            return Err(ActionError::MissingRecord(self.target_id.clone()));
        }

        // the record being advanced is edited in place, the store copy is stale
        if target_id == record.id {
            let mut data = record.data.clone();
            apply_assignments(
                ctx,
                &scope,
                &record.id,
                action_id,
                ctx.schema,
                &record.formdef_id,
                &mut data,
                &self.mappings,
                self.block_mode,
            )?;
            let old = std::mem::replace(&mut record.data, data);
            record.snapshot_edit(&old, ctx.schema, ctx.actor, Some(action_id), ctx.now());
            return Ok(Signal::Continue);
        }

        let store = ctx.engine.store();
        let mut target = store
            .load_record(&target_id)
            .map_err(ActionError::Storage)?
            .ok_or_else(|| ActionError::MissingRecord(target_id.clone()))?;
        let (formdef, workflow) = load_definitions(ctx, &target.formdef_id)?;
        let target_schema = Schema::combined(&formdef.fields, &workflow.backoffice_fields);

        let mut data = target.data.clone();
        apply_assignments(
            ctx,
            &scope,
            &record.id,
            action_id,
            &target_schema,
            &formdef.id,
            &mut data,
            &self.mappings,
            self.block_mode,
        )?;

        let entries = target.evolution.entries.len();
        let old = std::mem::replace(&mut target.data, data);
        let changed =
            target.snapshot_edit(&old, &target_schema, ctx.actor, Some(action_id), ctx.now());
        if changed || target.evolution.entries.len() != entries {
            store.save_record(&target).map_err(ActionError::Storage)?;
        }
        info!(record_id = %record.id, target_id = %target.id, changed, "linked record edited");
        Ok(Signal::Continue)
    }
}
