use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, warn};
use url::Url;

use super::{ActionContext, Signal};
use crate::collaborators::{ErrorReport, HttpMethod, HttpRequest};
use crate::error::{ActionError, ConnectionError};
use crate::evolution::Part;
use crate::record::Record;
use crate::template::Scope;
use crate::types::StatusId;
use crate::value::{DataMap, Value};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    #[n(0)]
    #[default]
    Json,
    #[n(1)]
    Raw,
}

/// What to do when a call fails in a given way.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum ErrorPolicy {
    #[n(0)]
    Pass,
    #[n(1)]
    Stop,
    #[n(2)]
    JumpTo(#[n(0)] StatusId),
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct WebserviceCall {
    #[n(0)]
    pub label: String,
    #[n(1)]
    pub url: String,
    #[n(2)]
    pub method: HttpMethod,
    #[n(3)]
    pub qs_data: BTreeMap<String, String>,
    #[n(4)]
    pub post_data: BTreeMap<String, String>,
    #[n(5)]
    pub response_type: ResponseType,
    #[n(6)]
    pub varname: Option<String>,
    #[n(7)]
    pub timeout_secs: Option<u64>,
    #[n(8)]
    pub on_app_error: ErrorPolicy,
    #[n(9)]
    pub on_4xx: ErrorPolicy,
    #[n(10)]
    pub on_5xx: ErrorPolicy,
    #[n(11)]
    pub on_bad_data: ErrorPolicy,
    #[n(12)]
    pub on_network_error: ErrorPolicy,
    #[n(13)]
    pub notify_on_errors: bool,
    #[n(14)]
    pub record_on_errors: bool,
    #[n(15)]
    pub record_errors_in_history: bool,
}

#[derive(Debug)]
enum CallFailure {
    Network(ConnectionError),
    Http(u16),
    BadData(String),
    AppError(Value),
}

impl WebserviceCall {
    pub fn new(label: &str, url: &str) -> Self {
        Self {
            label: label.to_string(),
            url: url.to_string(),
            method: HttpMethod::Get,
            qs_data: BTreeMap::new(),
            post_data: BTreeMap::new(),
            response_type: ResponseType::Json,
            varname: None,
            timeout_secs: None,
            on_app_error: ErrorPolicy::Pass,
            on_4xx: ErrorPolicy::Stop,
            on_5xx: ErrorPolicy::Stop,
            on_bad_data: ErrorPolicy::Pass,
            on_network_error: ErrorPolicy::Stop,
            notify_on_errors: false,
            record_on_errors: true,
            record_errors_in_history: false,
        }
    }

    pub fn set_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }
    pub fn set_varname(mut self, varname: &str) -> Self {
        self.varname = Some(varname.to_string());
        self
    }
    pub fn set_qs(mut self, key: &str, expression: &str) -> Self {
        self.qs_data.insert(key.to_string(), expression.to_string());
        self
    }
    pub fn set_post(mut self, key: &str, expression: &str) -> Self {
        self.post_data.insert(key.to_string(), expression.to_string());
        self
    }
    pub fn set_response_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }
    pub fn set_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
    pub fn set_on_app_error(mut self, policy: ErrorPolicy) -> Self {
        self.on_app_error = policy;
        self
    }
    pub fn set_on_4xx(mut self, policy: ErrorPolicy) -> Self {
        self.on_4xx = policy;
        self
    }
    pub fn set_on_5xx(mut self, policy: ErrorPolicy) -> Self {
        self.on_5xx = policy;
        self
    }
    pub fn set_on_bad_data(mut self, policy: ErrorPolicy) -> Self {
        self.on_bad_data = policy;
        self
    }
    pub fn set_on_network_error(mut self, policy: ErrorPolicy) -> Self {
        self.on_network_error = policy;
        self
    }
    pub fn set_notify_on_errors(mut self, enabled: bool) -> Self {
        self.notify_on_errors = enabled;
        self
    }
    pub fn set_record_on_errors(mut self, enabled: bool) -> Self {
        self.record_on_errors = enabled;
        self
    }
    pub fn set_record_errors_in_history(mut self, enabled: bool) -> Self {
        self.record_errors_in_history = enabled;
        self
    }

    pub(super) fn jump_targets(&self) -> Vec<&StatusId> {
        [
            &self.on_app_error,
            &self.on_4xx,
            &self.on_5xx,
            &self.on_bad_data,
            &self.on_network_error,
        ]
        .into_iter()
        .filter_map(|policy| match policy {
            ErrorPolicy::JumpTo(target) => Some(target),
            _ => None,
        })
        .collect()
    }

    fn build_request(
        &self,
        ctx: &ActionContext<'_>,
        scope: &Scope,
    ) -> Result<HttpRequest, ActionError> {
        let raw = ctx.evaluate(&self.url, scope)?.to_display();
        let mut url = Url::parse(raw.trim()).map_err(|source| ActionError::InvalidUrl {
            url: raw.clone(),
            source,
        })?;
        if !self.qs_data.is_empty() {
            let mut pairs = vec![];
            for (key, expression) in &self.qs_data {
                pairs.push((key, ctx.evaluate(expression, scope)?.to_display()));
            }
            url.query_pairs_mut().extend_pairs(pairs);
        }
        let url = url.to_string();

        let mut headers = vec![("Accept".to_string(), "application/json".to_string())];
        let body = if self.post_data.is_empty() {
            None
        } else {
            let mut payload = DataMap::new();
            for (key, expression) in &self.post_data {
                payload.insert(key.clone(), ctx.evaluate(expression, scope)?);
            }
            headers.push(("Content-Type".to_string(), "application/json".to_string()));
            Some(Value::Map(payload).to_json().to_string().into_bytes())
        };
        let method = match (self.method, &body) {
            (HttpMethod::Get, Some(_)) => HttpMethod::Post,
            (method, _) => method,
        };
        let timeout = self
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| ctx.engine.config().webservice_timeout());

        Ok(HttpRequest {
            method,
            url,
            headers,
            body,
            timeout,
        })
    }

    /// Calls the service, stores the outcome under `<varname>_*` in workflow data and applies
    /// the error policy matching how the call failed.
    pub(super) fn perform(
        &self,
        action_id: &str,
        record: &mut Record,
        ctx: &mut ActionContext<'_>,
    ) -> Result<Signal, ActionError> {
        let scope = ctx.scope(record);
        let request = self.build_request(ctx, &scope)?;
        let mut results = DataMap::new();

        let failure = match ctx.engine.http().request(&request) {
            Err(error) => {
                results.insert("connection_error".into(), Value::Str(error.to_string()));
                Some(CallFailure::Network(error))
            }
            Ok(response) => {
                results.insert("status".into(), Value::Int(i64::from(response.status)));
                let header_code = response.header("x-error-code").map(str::to_string);
                if let Some(code) = &header_code {
                    results.insert("app_error_header".into(), Value::Str(code.clone()));
                }

                if matches!(response.status, 204 | 205) {
                    None
                } else {
                    let parsed = match self.response_type {
                        ResponseType::Json => serde_json::from_slice::<serde_json::Value>(&response.body)
                            .map(Value::from_json)
                            .map_err(|e| e.to_string()),
                        ResponseType::Raw => {
                            Ok(Value::Str(String::from_utf8_lossy(&response.body).into_owned()))
                        }
                    };
                    let app_error_code = match (&header_code, &parsed) {
                        (Some(code), _) => code
                            .parse::<i64>()
                            .map(Value::Int)
                            .unwrap_or_else(|_| Value::Str(code.clone())),
                        (None, Ok(data)) => data.get_path("err").cloned().unwrap_or(Value::Int(0)),
                        (None, Err(_)) => Value::Int(0),
                    };
                    results.insert("app_error_code".into(), app_error_code.clone());

                    if response.status >= 400 {
                        let body = parsed.clone().unwrap_or_else(|_| {
                            Value::Str(String::from_utf8_lossy(&response.body).into_owned())
                        });
                        results.insert("error_response".into(), body);
                        Some(CallFailure::Http(response.status))
                    } else {
                        match parsed {
                            Err(message) => Some(CallFailure::BadData(message)),
                            Ok(data) if is_app_error(&app_error_code) => {
                                results.insert("error_response".into(), data);
                                Some(CallFailure::AppError(app_error_code))
                            }
                            Ok(data) => {
                                results.insert("response".into(), data);
                                None
                            }
                        }
                    }
                }
            }
        };

        if let Some(varname) = &self.varname {
            for (key, value) in results {
                record
                    .workflow_data
                    .insert(format!("{varname}_{key}"), value);
            }
        }

        let Some(failure) = failure else {
            debug!(record_id = %record.id, action_id, url = %request.url, "webservice call succeeded");
            return Ok(Signal::Continue);
        };
        self.handle_failure(action_id, record, ctx, &request.url, failure)
    }

    fn handle_failure(
        &self,
        action_id: &str,
        record: &mut Record,
        ctx: &ActionContext<'_>,
        url: &str,
        failure: CallFailure,
    ) -> Result<Signal, ActionError> {
        let (policy, class_name, message) = match failure {
            CallFailure::Network(error) => {
                let error = ActionError::from(error);
                (&self.on_network_error, error.class_name().to_string(), error.to_string())
            }
            CallFailure::Http(status) => {
                let policy = if status >= 500 { &self.on_5xx } else { &self.on_4xx };
                let error = ActionError::Http {
                    url: url.to_string(),
                    status,
                };
                (policy, error.class_name().to_string(), error.to_string())
            }
            CallFailure::BadData(message) => (
                &self.on_bad_data,
                "BadDataError".to_string(),
                format!("invalid response from {url}: {message}"),
            ),
            CallFailure::AppError(code) => (
                &self.on_app_error,
                "AppError".to_string(),
                format!("{url} answered with application error {}", code.to_display()),
            ),
        };
        warn!(record_id = %record.id, action_id, url, class_name = %class_name, "webservice call failed");

        let errors = ctx.engine.errors();
        if self.record_on_errors {
            errors.record_error(ErrorReport {
                summary: format!("[WSCALL] {}", self.label),
                record_id: Some(record.id.clone()),
                action_id: Some(action_id.to_string()),
                class_name: class_name.clone(),
                message: message.clone(),
            });
        }
        if self.notify_on_errors {
            errors.notify(
                &ctx.engine.config().default_notify_recipients,
                &format!("[WSCALL] {} failed", self.label),
                &format!("record {}: {message}", record.id),
            );
        }
        if self.record_errors_in_history {
            let part = Part::WsCallError {
                label: self.label.clone(),
                message,
                datetime: record.evolution.next_timestamp(ctx.now()),
            };
            record.add_part(part, ctx.actor);
        }

        match policy {
            ErrorPolicy::Pass => Ok(Signal::Continue),
            ErrorPolicy::Stop => Ok(Signal::Stop),
            ErrorPolicy::JumpTo(target) if ctx.workflow.status(target).is_some() => {
                Ok(Signal::Jump(target.clone()))
            }
            ErrorPolicy::JumpTo(target) => {
                let error = ActionError::UnknownStatus(target.clone());
                ctx.report(&record.id, action_id, &error);
                Ok(Signal::Stop)
            }
        }
    }
}

fn is_app_error(code: &Value) -> bool {
    match code {
        Value::Null => false,
        Value::Int(i) => *i != 0,
        Value::Bool(b) => *b,
        other => !other.is_empty() && other.to_display() != "0",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_error_codes() {
        assert!(!is_app_error(&Value::Int(0)));
        assert!(!is_app_error(&Value::from("0")));
        assert!(!is_app_error(&Value::Null));
        assert!(is_app_error(&Value::Int(1)));
        assert!(is_app_error(&Value::from("not-found")));
    }

    #[test]
    fn default_policies() {
        let call = WebserviceCall::new("ws", "http://remote.example.net/");
        assert_eq!(call.on_app_error, ErrorPolicy::Pass);
        assert_eq!(call.on_4xx, ErrorPolicy::Stop);
        assert_eq!(call.on_5xx, ErrorPolicy::Stop);
        assert_eq!(call.on_bad_data, ErrorPolicy::Pass);
        assert_eq!(call.on_network_error, ErrorPolicy::Stop);
        assert!(call.record_on_errors);
        assert!(!call.notify_on_errors);
        assert!(call.jump_targets().is_empty());
    }
}
