//! Actions attached to workflow statuses
use std::collections::BTreeMap;

use tracing::warn;

use crate::collaborators::ErrorReport;
use crate::error::{ActionError, TemplateError};
use crate::fields::{BlockWrite, FieldDef, FieldKind, Schema};
use crate::record::Record;
use crate::template::Scope;
use crate::types::{StatusId, TimeStamp};
use crate::value::{DataMap, Value};
use crate::workflow::{Engine, Workflow};

mod control;
mod linked;
mod set_field;
mod webservice;

pub use control::{Choice, Editable, Jump, JumpMode, RegisterComment};
pub use linked::{CreateRecord, EditRecord};
pub use set_field::SetField;
pub use webservice::{ErrorPolicy, ResponseType, WebserviceCall};

/// What the engine should do after an action ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Continue,
    Jump(StatusId),
    /// Waiting on a human; nothing else runs until the next trigger.
    Pause,
    /// Halt this invocation without error.
    Stop,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct Action {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub condition: Option<String>,
    #[n(2)]
    pub kind: ActionKind,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub enum ActionKind {
    #[n(0)]
    SetField(#[n(0)] SetField),
    #[n(1)]
    CreateRecord(#[n(0)] CreateRecord),
    #[n(2)]
    EditRecord(#[n(0)] EditRecord),
    #[n(3)]
    Webservice(#[n(0)] WebserviceCall),
    #[n(4)]
    Jump(#[n(0)] Jump),
    #[n(5)]
    Choice(#[n(0)] Choice),
    #[n(6)]
    Editable(#[n(0)] Editable),
    #[n(7)]
    Comment(#[n(0)] RegisterComment),
}

/// A `(field id, expression)` pair; `block$sub` addresses a sub-field of a block row.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct FieldAssignment {
    #[n(0)]
    pub field_id: String,
    #[n(1)]
    pub expression: String,
}

impl FieldAssignment {
    pub fn new(field_id: &str, expression: &str) -> Self {
        Self {
            field_id: field_id.to_string(),
            expression: expression.to_string(),
        }
    }
}

impl Action {
    pub fn new(id: &str, kind: ActionKind) -> Self {
        Self {
            id: id.to_string(),
            condition: None,
            kind,
        }
    }

    pub fn set_condition(mut self, condition: &str) -> Self {
        self.condition = Some(condition.to_string());
        self
    }

    pub fn perform(
        &self,
        record: &mut Record,
        ctx: &mut ActionContext<'_>,
    ) -> Result<Signal, ActionError> {
        match &self.kind {
            ActionKind::SetField(action) => action.perform(&self.id, record, ctx),
            ActionKind::CreateRecord(action) => action.perform(&self.id, record, ctx),
            ActionKind::EditRecord(action) => action.perform(&self.id, record, ctx),
            ActionKind::Webservice(action) => action.perform(&self.id, record, ctx),
            ActionKind::Jump(action) => action.perform(ctx),
            ActionKind::Choice(_) | ActionKind::Editable(_) => Ok(Signal::Pause),
            ActionKind::Comment(action) => action.perform(record, ctx),
        }
    }

    /// Statuses this action can move a record to.
    pub fn targets(&self) -> Vec<&StatusId> {
        match &self.kind {
            ActionKind::Jump(jump) => vec![&jump.target],
            ActionKind::Choice(choice) => vec![&choice.target],
            ActionKind::Webservice(call) => call.jump_targets(),
            _ => vec![],
        }
    }

    /// Holds the record in its status until a human or an external event acts.
    pub fn is_waitpoint(&self) -> bool {
        match &self.kind {
            ActionKind::Jump(jump) => jump.mode != JumpMode::Immediate,
            ActionKind::Choice(_) | ActionKind::Editable(_) => true,
            _ => false,
        }
    }
}

/// Everything an action may touch besides the record itself, fixed for one advancement.
pub struct ActionContext<'a> {
    pub engine: &'a Engine,
    pub workflow: &'a Workflow,
    pub schema: &'a Schema,
    pub actor: Option<&'a str>,
    /// Create actions on the current chain of nested creations.
    pub creations: &'a mut Vec<String>,
}

impl ActionContext<'_> {
    pub fn now(&self) -> TimeStamp {
        self.engine.clock().now()
    }

    pub fn scope(&self, record: &Record) -> Scope {
        Scope::for_record(record, self.schema, self.actor)
    }

    pub fn evaluate(&self, expression: &str, scope: &Scope) -> Result<Value, TemplateError> {
        self.engine.evaluator().evaluate(expression, scope)
    }

    /// Logs a failed action and hands it to the error sink.
    pub fn report(&self, record_id: &str, action_id: &str, error: &ActionError) {
        warn!(record_id, action_id, error = %error, "action failed");
        self.engine.errors().record_error(ErrorReport {
            summary: format!("action {action_id} failed"),
            record_id: Some(record_id.to_string()),
            action_id: Some(action_id.to_string()),
            class_name: error.class_name().to_string(),
            message: error.to_string(),
        });
    }
}

/// Evaluates `assignments` into `data`.
///
/// Every target is resolved against `schema` before anything is written, so an unknown field
/// leaves `data` untouched. Evaluation and value errors skip that one field and are reported.
#[allow(clippy::too_many_arguments)]
pub(crate) fn apply_assignments(
    ctx: &ActionContext<'_>,
    scope: &Scope,
    record_id: &str,
    action_id: &str,
    schema: &Schema,
    target: &str,
    data: &mut DataMap,
    assignments: &[FieldAssignment],
    block_mode: BlockWrite,
) -> Result<(), ActionError> {
    let unknown = |field_id: &str| ActionError::UnknownField {
        field_id: field_id.to_string(),
        target: target.to_string(),
    };
    let mut resolved: Vec<(&FieldAssignment, &FieldDef, Option<&str>)> = vec![];
    for assignment in assignments {
        let (base, sub) = match assignment.field_id.split_once('$') {
            Some((base, sub)) => (base, Some(sub)),
            None => (assignment.field_id.as_str(), None),
        };
        let field = schema.get(base).ok_or_else(|| unknown(&assignment.field_id))?;
        if let Some(sub) = sub {
            if field.block.as_ref().and_then(|b| b.field(sub)).is_none() {
                return Err(unknown(&assignment.field_id));
            }
        }
        resolved.push((assignment, field, sub));
    }

    let years = ctx.engine.config().date_years();
    let mut rows: BTreeMap<&str, (&FieldDef, DataMap)> = BTreeMap::new();
    for (assignment, field, sub) in resolved {
        let value = match ctx.evaluate(&assignment.expression, scope) {
            Ok(value) => value,
            Err(error) => {
                ctx.report(record_id, action_id, &ActionError::Template(error));
                continue;
            }
        };
        if let Some(sub) = sub {
            rows.entry(field.id.as_str())
                .or_insert_with(|| (field, DataMap::new()))
                .1
                .insert(sub.to_string(), value);
            continue;
        }
        let written = match (field.kind, &value) {
            (FieldKind::Block, Value::Map(row)) => {
                field.write_block_row(data, row, block_mode, years.clone())
            }
            _ => field.assign(data, &value, years.clone()),
        };
        if let Err(source) = written {
            let error = ActionError::SetValue {
                field_id: field.id.clone(),
                source,
            };
            ctx.report(record_id, action_id, &error);
        }
    }

    for (field, row) in rows.values() {
        if let Err(source) = field.write_block_row(data, row, block_mode, years.clone()) {
            let error = ActionError::SetValue {
                field_id: field.id.clone(),
                source,
            };
            ctx.report(record_id, action_id, &error);
        }
    }
    Ok(())
}
