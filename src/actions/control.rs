use super::{ActionContext, Signal};
use crate::error::{ActionError, TemplateError};
use crate::evolution::Part;
use crate::record::Record;
use crate::types::StatusId;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum JumpMode {
    #[n(0)]
    Immediate,
    /// Fires on timer evaluation once the record sat `seconds` (an expression) without update.
    #[n(1)]
    Timeout {
        #[n(0)]
        seconds: String,
    },
    /// Fires when an external callback names it.
    #[n(2)]
    Trigger {
        #[n(0)]
        name: String,
    },
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Jump {
    #[n(0)]
    pub target: StatusId,
    #[n(1)]
    pub mode: JumpMode,
}

impl Jump {
    pub fn new(target: &str) -> Self {
        Self {
            target: StatusId::from(target),
            mode: JumpMode::Immediate,
        }
    }

    pub fn set_mode(mut self, mode: JumpMode) -> Self {
        self.mode = mode;
        self
    }

    /// Immediate jumps fire right away; timeout and trigger jumps wait for their event.
    pub(super) fn perform(&self, ctx: &ActionContext<'_>) -> Result<Signal, ActionError> {
        if self.mode != JumpMode::Immediate {
            return Ok(Signal::Continue);
        }
        if ctx.workflow.status(&self.target).is_none() {
            return Err(ActionError::UnknownStatus(self.target.clone()));
        }
        Ok(Signal::Jump(self.target.clone()))
    }

    pub fn matches_trigger(&self, trigger: &str) -> bool {
        matches!(&self.mode, JumpMode::Trigger { name } if name == trigger)
    }

    /// Whether a timeout jump is due; a timeout that is not a positive number is an error.
    pub fn is_due(&self, record: &Record, ctx: &ActionContext<'_>) -> Result<bool, ActionError> {
        let JumpMode::Timeout { seconds } = &self.mode else {
            return Ok(false);
        };
        let value = ctx.evaluate(seconds, &ctx.scope(record))?;
        match value.as_f64() {
            Some(secs) if secs > 0.0 => {
                Ok(ctx.now().seconds_since(&record.last_update_time()) >= secs)
            }
            _ => Err(TemplateError::new(
                seconds.as_str(),
                format!("timeout {:?} is not a positive number of seconds", value.to_display()),
            )
            .into()),
        }
    }
}

/// A labelled button offered to humans while the record is in the status.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Choice {
    #[n(0)]
    pub label: String,
    #[n(1)]
    pub target: StatusId,
    #[n(2)]
    pub roles: Vec<String>,
}

impl Choice {
    pub fn new(label: &str, target: &str) -> Self {
        Self {
            label: label.to_string(),
            target: StatusId::from(target),
            roles: vec![],
        }
    }

    /// Restricts the button to these users, or `_submitter`.
    pub fn set_roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }
}

/// Lets humans edit the record; automatic progress stops here.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq, Default)]
pub struct Editable {
    #[n(0)]
    pub label: String,
    #[n(1)]
    pub roles: Vec<String>,
}

impl Editable {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            roles: vec![],
        }
    }

    pub fn set_roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct RegisterComment {
    #[n(0)]
    pub text: String,
}

impl RegisterComment {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
        }
    }

    pub(super) fn perform(
        &self,
        record: &mut Record,
        ctx: &ActionContext<'_>,
    ) -> Result<Signal, ActionError> {
        let text = ctx.evaluate(&self.text, &ctx.scope(record))?.to_display();
        let part = Part::Comment {
            text,
            user_id: ctx.actor.map(str::to_string),
            datetime: record.evolution.next_timestamp(ctx.now()),
        };
        record.add_part(part, ctx.actor);
        Ok(Signal::Continue)
    }
}
