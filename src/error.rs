//! Error taxonomy shared by the field model, the history log and the engine

use crate::types::StatusId;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("invalid {kind} value {value:?} (field id: {field_id})")]
    InvalidValue {
        field_id: String,
        kind: &'static str,
        value: String,
    },
    #[error("date {value} is outside of the accepted range (field id: {field_id})")]
    DateOutOfRange { field_id: String, value: String },
    #[error("a value is required (field id: {0})")]
    Required(String),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SetValueError {
    #[error("no matching value in data source (field id: {field_id}, value: {value:?})")]
    NoMatchingValue { field_id: String, value: String },
    #[error("invalid value for block (field id: {0})")]
    InvalidBlock(String),
    #[error("invalid coordinates {value:?} (field id: {field_id})")]
    InvalidCoordinates { field_id: String, value: String },
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Failure of the expression evaluator, keeps the offending expression text.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("failed to evaluate {expression:?}: {message}")]
pub struct TemplateError {
    pub expression: String,
    pub message: String,
}

impl TemplateError {
    pub fn new(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            message: message.into(),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum HistoryError {
    #[error("No data found for this datetime.")]
    NoDataFound,
    #[error("Invalid datetime format: {0:?}")]
    InvalidTimestampFormat(String),
    #[error("snapshot chain is broken between parts {index} and {}", .index + 1)]
    BrokenChain { index: usize },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    #[error("timed out after {secs}s calling {url}")]
    Timeout { url: String, secs: u64 },
    #[error("failed to call {url}: {message}")]
    Failed { url: String, message: String },
}

/// Whether a failed action lets the status carry on or stops the invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    Recoverable,
    Abort,
}

#[derive(thiserror::Error, Debug)]
pub enum ActionError {
    #[error("failed to set field {field_id}: {source}")]
    SetValue {
        field_id: String,
        #[source]
        source: SetValueError,
    },
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("invalid webservice url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("webservice {url} answered with status {status}")]
    Http { url: String, status: u16 },
    #[error("unknown field {field_id} in {target}")]
    UnknownField { field_id: String, target: String },
    #[error("reference to unknown status {0}")]
    UnknownStatus(StatusId),
    #[error("target record {0} could not be found")]
    MissingRecord(String),
    #[error("definition {0} could not be found")]
    MissingDefinition(String),
    #[error("storage failure: {0}")]
    Storage(#[source] anyhow::Error),
}

impl ActionError {
    pub fn policy(&self) -> FailurePolicy {
        match self {
            ActionError::SetValue { .. }
            | ActionError::Template(_)
            | ActionError::Connection(_)
            | ActionError::InvalidUrl { .. }
            | ActionError::Http { .. }
            | ActionError::MissingRecord(_) => FailurePolicy::Recoverable,
            ActionError::UnknownField { .. }
            | ActionError::UnknownStatus(_)
            | ActionError::MissingDefinition(_)
            | ActionError::Storage(_) => FailurePolicy::Abort,
        }
    }

    /// Short class name handed to the error sink alongside the message.
    pub fn class_name(&self) -> &'static str {
        match self {
            ActionError::SetValue { .. } => "SetValueError",
            ActionError::Template(_) => "TemplateError",
            ActionError::Connection(_) => "ConnectionError",
            ActionError::InvalidUrl { .. } => "InvalidURLError",
            ActionError::Http { .. } => "HTTPError",
            ActionError::UnknownField { .. } => "UnknownFieldError",
            ActionError::UnknownStatus(_) => "UnknownStatusError",
            ActionError::MissingRecord(_) => "MissingRecordError",
            ActionError::MissingDefinition(_) => "MissingDefinitionError",
            ActionError::Storage(_) => "StorageError",
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("record {record_id} is in unknown status {status}")]
    UnknownStatus { record_id: String, status: StatusId },
    #[error("loop detected on record {record_id} at status {status}")]
    LoopDetected { record_id: String, status: StatusId },
    #[error("action {action_id} aborted the workflow: {source}")]
    Aborted {
        action_id: String,
        #[source]
        source: ActionError,
    },
    #[error("no action {action_id} available in status {status}")]
    UnknownAction { action_id: String, status: StatusId },
    #[error("{actor} may not use action {action_id}")]
    NotAllowed { action_id: String, actor: String },
    #[error("edit through {action_id} refused: {source}")]
    EditRefused {
        action_id: String,
        #[source]
        source: ActionError,
    },
}

/// Static problems found in a workflow graph before it runs.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("initial status {0} does not exist")]
    MissingInitialStatus(StatusId),
    #[error("status {0} is declared more than once")]
    DuplicateStatus(StatusId),
    #[error("action id {0} is used more than once")]
    DuplicateAction(String),
    #[error("action {action_id} targets unknown status {target}")]
    UnknownTarget { action_id: String, target: StatusId },
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}
