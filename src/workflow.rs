//! Status graph and the engine that advances records through it
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::actions::{Action, ActionContext, ActionKind, Signal};
use crate::collaborators::{ErrorReport, ErrorSink, HttpClient, RecordStore};
use crate::config::EngineConfig;
use crate::error::{ActionError, EngineError, FailurePolicy, WorkflowError};
use crate::fields::{FieldDef, FormDef, Schema};
use crate::record::Record;
use crate::template::{Evaluator, Interpreter};
use crate::types::{Clock, StatusId, SystemClock};
use crate::value::DataMap;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct Status {
    #[n(0)]
    pub id: StatusId,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub actions: Vec<Action>,
    #[n(3)]
    pub visibility: Vec<String>, // roles allowed to see records in this status, empty is everyone
}

/// Role standing for whoever submitted the record.
pub const SUBMITTER_ROLE: &str = "_submitter";

/// Whether `actor` holds one of `roles`. Roles name users directly, or [`SUBMITTER_ROLE`].
/// An empty list admits everyone, including anonymous callers.
pub fn actor_has_role(roles: &[String], record: &Record, actor: Option<&str>) -> bool {
    if roles.is_empty() {
        return true;
    }
    let Some(actor) = actor else {
        return false;
    };
    roles.iter().any(|role| {
        role == actor || (role == SUBMITTER_ROLE && record.user_id.as_deref() == Some(actor))
    })
}

impl Status {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: StatusId::from(id),
            name: name.to_string(),
            actions: vec![],
            visibility: vec![],
        }
    }

    pub fn add_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn set_visibility(mut self, roles: Vec<String>) -> Self {
        self.visibility = roles;
        self
    }

    pub fn action(&self, id: &str) -> Option<&Action> {
        self.actions.iter().find(|action| action.id == id)
    }

    pub fn has_waitpoint(&self) -> bool {
        self.actions.iter().any(Action::is_waitpoint)
    }

    pub fn visible_to(&self, record: &Record, actor: Option<&str>) -> bool {
        actor_has_role(&self.visibility, record, actor)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct Workflow {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub initial_status: StatusId,
    #[n(3)]
    pub statuses: Vec<Status>,
    #[n(4)]
    pub backoffice_fields: Vec<FieldDef>,
}

impl Workflow {
    pub fn new(id: &str, name: &str, initial_status: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            initial_status: StatusId::from(initial_status),
            statuses: vec![],
            backoffice_fields: vec![],
        }
    }

    pub fn add_status(mut self, status: Status) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn set_backoffice_fields(mut self, fields: Vec<FieldDef>) -> Self {
        self.backoffice_fields = fields;
        self
    }

    pub fn status(&self, id: &StatusId) -> Option<&Status> {
        self.statuses.iter().find(|status| status.id == *id)
    }

    /// Every structural problem of the graph.
    pub fn validate(&self) -> Result<(), Vec<WorkflowError>> {
        let mut problems = vec![];
        if self.status(&self.initial_status).is_none() {
            problems.push(WorkflowError::MissingInitialStatus(
                self.initial_status.clone(),
            ));
        }
        let mut status_ids = BTreeSet::new();
        let mut action_ids = BTreeSet::new();
        for status in &self.statuses {
            if !status_ids.insert(&status.id) {
                problems.push(WorkflowError::DuplicateStatus(status.id.clone()));
            }
            for action in &status.actions {
                if !action_ids.insert(action.id.as_str()) {
                    problems.push(WorkflowError::DuplicateAction(action.id.clone()));
                }
                for target in action.targets() {
                    if self.status(target).is_none() {
                        problems.push(WorkflowError::UnknownTarget {
                            action_id: action.id.clone(),
                            target: target.clone(),
                        });
                    }
                }
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }

    /// Statuses no chain of jumps, buttons or webservice fallbacks leads to from the initial one.
    pub fn unreachable_statuses(&self) -> Vec<&StatusId> {
        let mut seen: BTreeSet<&StatusId> = BTreeSet::new();
        let mut queue = VecDeque::from([&self.initial_status]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(status) = self.status(id) {
                queue.extend(status.actions.iter().flat_map(Action::targets));
            }
        }
        self.statuses
            .iter()
            .map(|status| &status.id)
            .filter(|id| !seen.contains(id))
            .collect()
    }
}

/// What started an advancement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Run the actions of the current status (submission, import, linked creation).
    Created,
    /// A human pressed the choice button with this action id.
    Button(String),
    /// An external callback naming a trigger jump.
    Callback(String),
    /// Periodic evaluation of timeout jumps.
    Timer,
}

/// Where an advancement settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// No automatic progress left and nothing is awaited.
    Stable,
    /// Waiting on a human or an external event.
    Paused,
    /// An action halted processing (webservice error policy).
    Stopped,
}

fn not_allowed(action_id: &str, actor: Option<&str>) -> EngineError {
    EngineError::NotAllowed {
        action_id: action_id.to_string(),
        actor: actor.unwrap_or("anonymous").to_string(),
    }
}

enum Dispatch {
    Run,
    Jump(StatusId, String),
    Settle(Outcome),
}

/// Runs statuses' actions and follows jumps until the record settles.
///
/// Holds no per-record state: callers serialize calls on the same record.
pub struct Engine {
    evaluator: Arc<dyn Evaluator>,
    store: Arc<dyn RecordStore>,
    http: Arc<dyn HttpClient>,
    errors: Arc<dyn ErrorSink>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        http: Arc<dyn HttpClient>,
        errors: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            evaluator: Arc::new(Interpreter),
            store,
            http,
            errors,
            clock: Arc::new(SystemClock),
            config: EngineConfig::default(),
        }
    }

    pub fn set_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }
    pub fn set_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
    pub fn set_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn evaluator(&self) -> &dyn Evaluator {
        self.evaluator.as_ref()
    }
    pub fn store(&self) -> &dyn RecordStore {
        self.store.as_ref()
    }
    pub fn http(&self) -> &dyn HttpClient {
        self.http.as_ref()
    }
    pub fn errors(&self) -> &dyn ErrorSink {
        self.errors.as_ref()
    }
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Advances `record` in response to `event` until it settles.
    ///
    /// Recoverable action failures are reported and skipped. On error the record keeps every
    /// change made before the failing action and stays in the status it reached.
    pub fn advance(
        &self,
        record: &mut Record,
        workflow: &Workflow,
        formdef: &FormDef,
        event: Event,
        actor: Option<&str>,
    ) -> Result<Outcome, EngineError> {
        let schema = Schema::combined(&formdef.fields, &workflow.backoffice_fields);
        self.advance_nested(record, workflow, &schema, event, actor, &mut vec![])
    }

    pub(crate) fn advance_nested(
        &self,
        record: &mut Record,
        workflow: &Workflow,
        schema: &Schema,
        event: Event,
        actor: Option<&str>,
        creations: &mut Vec<String>,
    ) -> Result<Outcome, EngineError> {
        let mut ctx = ActionContext {
            engine: self,
            workflow,
            schema,
            actor,
            creations,
        };

        let mut pending = match self.dispatch(record, &ctx, &event)? {
            Dispatch::Run => None,
            Dispatch::Jump(target, action_id) => Some((target, action_id)),
            Dispatch::Settle(outcome) => return Ok(outcome),
        };
        let mut visited: HashMap<StatusId, DataMap> = HashMap::new();
        let mut jumps = 0;

        loop {
            if let Some((target, action_id)) = pending.take() {
                if workflow.status(&target).is_none() {
                    let source = ActionError::UnknownStatus(target);
                    ctx.report(&record.id, &action_id, &source);
                    return Err(EngineError::Aborted { action_id, source });
                }
                jumps += 1;
                if jumps > self.config.max_jumps {
                    return Err(self.loop_detected(record));
                }
                info!(record_id = %record.id, from = %record.status, to = %target, action_id = %action_id, "jump");
                record.jump_to(target, Some(action_id.as_str()), actor, self.clock.now());
            }

            let status_id = record.status.clone();
            if visited.get(&status_id) == Some(&record.data) {
                return Err(self.loop_detected(record));
            }
            visited.insert(status_id.clone(), record.data.clone());

            let Some(status) = workflow.status(&status_id) else {
                return Err(self.unknown_status(record));
            };
            debug!(record_id = %record.id, status = %status_id, "running status actions");

            for action in &status.actions {
                if !self.condition_holds(action, record, &ctx) {
                    debug!(record_id = %record.id, action_id = %action.id, "condition false, skipped");
                    continue;
                }
                match action.perform(record, &mut ctx) {
                    Ok(Signal::Continue) => {}
                    Ok(Signal::Jump(target)) => {
                        pending = Some((target, action.id.clone()));
                        break;
                    }
                    Ok(Signal::Pause) => return Ok(Outcome::Paused),
                    Ok(Signal::Stop) => return Ok(Outcome::Stopped),
                    Err(error) => {
                        ctx.report(&record.id, &action.id, &error);
                        if error.policy() == FailurePolicy::Abort {
                            return Err(EngineError::Aborted {
                                action_id: action.id.clone(),
                                source: error,
                            });
                        }
                    }
                }
            }

            if pending.is_none() {
                return Ok(if status.has_waitpoint() {
                    Outcome::Paused
                } else {
                    Outcome::Stable
                });
            }
        }
    }

    // picks what an event does before the status loop runs
    fn dispatch(
        &self,
        record: &Record,
        ctx: &ActionContext<'_>,
        event: &Event,
    ) -> Result<Dispatch, EngineError> {
        if *event == Event::Created {
            return Ok(Dispatch::Run);
        }
        let Some(status) = ctx.workflow.status(&record.status) else {
            return Err(self.unknown_status(record));
        };
        let unknown = |action_id: &str| EngineError::UnknownAction {
            action_id: action_id.to_string(),
            status: status.id.clone(),
        };

        match event {
            Event::Created => Ok(Dispatch::Run),
            Event::Button(action_id) => {
                let action = status.action(action_id).ok_or_else(|| unknown(action_id))?;
                let ActionKind::Choice(choice) = &action.kind else {
                    return Err(unknown(action_id));
                };
                if !self.condition_holds(action, record, ctx) {
                    return Err(unknown(action_id));
                }
                if !actor_has_role(&choice.roles, record, ctx.actor) {
                    return Err(not_allowed(action_id, ctx.actor));
                }
                Ok(Dispatch::Jump(choice.target.clone(), action.id.clone()))
            }
            Event::Callback(name) => status
                .actions
                .iter()
                .find(|action| match &action.kind {
                    ActionKind::Jump(jump) => {
                        jump.matches_trigger(name) && self.condition_holds(action, record, ctx)
                    }
                    _ => false,
                })
                .and_then(|action| match &action.kind {
                    ActionKind::Jump(jump) => {
                        Some(Dispatch::Jump(jump.target.clone(), action.id.clone()))
                    }
                    _ => None,
                })
                .ok_or_else(|| unknown(name)),
            Event::Timer => {
                for action in &status.actions {
                    let ActionKind::Jump(jump) = &action.kind else {
                        continue;
                    };
                    if !self.condition_holds(action, record, ctx) {
                        continue;
                    }
                    match jump.is_due(record, ctx) {
                        Ok(true) => {
                            return Ok(Dispatch::Jump(jump.target.clone(), action.id.clone()));
                        }
                        Ok(false) => {}
                        Err(error) => ctx.report(&record.id, &action.id, &error),
                    }
                }
                Ok(Dispatch::Settle(if status.has_waitpoint() {
                    Outcome::Paused
                } else {
                    Outcome::Stable
                }))
            }
        }
    }

    // a failing condition is reported and counts as false
    fn condition_holds(&self, action: &Action, record: &Record, ctx: &ActionContext<'_>) -> bool {
        let Some(condition) = &action.condition else {
            return true;
        };
        match self
            .evaluator
            .evaluate_condition(condition, &ctx.scope(record))
        {
            Ok(holds) => holds,
            Err(error) => {
                ctx.report(&record.id, &action.id, &ActionError::Template(error));
                false
            }
        }
    }

    /// Applies a human edit offered by the editable action `action_id` of the current status.
    ///
    /// Every value is checked before anything is written; one bad value refuses the whole edit.
    /// Returns whether the data changed. The record stays where it is.
    pub fn edit(
        &self,
        record: &mut Record,
        workflow: &Workflow,
        formdef: &FormDef,
        action_id: &str,
        changes: &DataMap,
        actor: Option<&str>,
    ) -> Result<bool, EngineError> {
        let Some(status) = workflow.status(&record.status) else {
            return Err(self.unknown_status(record));
        };
        let schema = Schema::combined(&formdef.fields, &workflow.backoffice_fields);
        let mut creations = vec![];
        let ctx = ActionContext {
            engine: self,
            workflow,
            schema: &schema,
            actor,
            creations: &mut creations,
        };

        let unknown = || EngineError::UnknownAction {
            action_id: action_id.to_string(),
            status: status.id.clone(),
        };
        let action = status.action(action_id).ok_or_else(unknown)?;
        let ActionKind::Editable(editable) = &action.kind else {
            return Err(unknown());
        };
        if !self.condition_holds(action, record, &ctx) {
            return Err(unknown());
        }
        if !actor_has_role(&editable.roles, record, actor) {
            return Err(not_allowed(action_id, actor));
        }

        let refused = |source: ActionError| EngineError::EditRefused {
            action_id: action_id.to_string(),
            source,
        };
        let years = self.config.date_years();
        let mut data = record.data.clone();
        for (field_id, raw) in changes {
            let field = schema.get(field_id).ok_or_else(|| {
                refused(ActionError::UnknownField {
                    field_id: field_id.clone(),
                    target: formdef.id.clone(),
                })
            })?;
            field.assign(&mut data, raw, years.clone()).map_err(|source| {
                refused(ActionError::SetValue {
                    field_id: field_id.clone(),
                    source,
                })
            })?;
        }

        let old = std::mem::replace(&mut record.data, data);
        let changed = record.snapshot_edit(&old, &schema, actor, Some(action_id), self.clock.now());
        info!(record_id = %record.id, action_id, changed, "record edited");
        Ok(changed)
    }

    fn unknown_status(&self, record: &Record) -> EngineError {
        error!(record_id = %record.id, status = %record.status, "record is in an unknown status");
        self.errors.record_error(ErrorReport {
            summary: format!("unknown status {}", record.status),
            record_id: Some(record.id.clone()),
            action_id: None,
            class_name: "UnknownStatusError".into(),
            message: format!("record {} is in unknown status {}", record.id, record.status),
        });
        EngineError::UnknownStatus {
            record_id: record.id.clone(),
            status: record.status.clone(),
        }
    }

    fn loop_detected(&self, record: &Record) -> EngineError {
        warn!(record_id = %record.id, status = %record.status, "loop detected");
        self.errors.record_error(ErrorReport {
            summary: format!("loop detected at status {}", record.status),
            record_id: Some(record.id.clone()),
            action_id: None,
            class_name: "LoopDetectedError".into(),
            message: format!(
                "record {} revisited status {} without any data change",
                record.id, record.status
            ),
        });
        EngineError::LoopDetected {
            record_id: record.id.clone(),
            status: record.status.clone(),
        }
    }
}
