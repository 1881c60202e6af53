//! Contracts the engine needs from the outside world, plus in-memory implementations
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;

use crate::error::ConnectionError;
use crate::fields::FormDef;
use crate::record::Record;
use crate::value::FileValue;
use crate::workflow::Workflow;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpMethod {
    #[n(0)]
    #[default]
    Get,
    #[n(1)]
    Post,
    #[n(2)]
    Put,
    #[n(3)]
    Patch,
    #[n(4)]
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: vec![],
            body: body.as_bytes().to_vec(),
        }
    }
    pub fn set_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
    /// Header lookup, case insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

pub trait HttpClient: Send + Sync {
    fn request(&self, request: &HttpRequest) -> Result<HttpResponse, ConnectionError>;
}

/// What the operator sees about a failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorReport {
    pub summary: String,
    pub record_id: Option<String>,
    pub action_id: Option<String>,
    pub class_name: String,
    pub message: String,
}

/// Operator facing error log and notifications. Fire and forget.
pub trait ErrorSink: Send + Sync {
    fn record_error(&self, report: ErrorReport);
    fn notify(&self, recipients: &[String], subject: &str, body: &str);
}

pub trait BlobStore: Send + Sync {
    fn store(&self, bytes: &[u8], filename: &str, content_type: &str) -> anyhow::Result<String>;
    fn retrieve(&self, handle: &str) -> anyhow::Result<Vec<u8>>;
}

/// Stores `bytes` and returns the file value to put in record data.
pub fn upload(
    blobs: &dyn BlobStore,
    bytes: &[u8],
    filename: &str,
    content_type: &str,
) -> anyhow::Result<FileValue> {
    let handle = blobs.store(bytes, filename, content_type)?;
    Ok(FileValue {
        handle,
        filename: filename.to_string(),
        content_type: content_type.to_string(),
        digest: sha256::digest(bytes),
    })
}

/// Persistence for records and the definitions they reference.
pub trait RecordStore: Send + Sync {
    fn load_record(&self, id: &str) -> anyhow::Result<Option<Record>>;
    fn save_record(&self, record: &Record) -> anyhow::Result<()>;
    fn load_workflow(&self, id: &str) -> anyhow::Result<Option<Workflow>>;
    fn save_workflow(&self, workflow: &Workflow) -> anyhow::Result<()>;
    fn load_formdef(&self, id: &str) -> anyhow::Result<Option<FormDef>>;
    fn save_formdef(&self, formdef: &FormDef) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Record>>,
    workflows: Mutex<HashMap<String, Workflow>>,
    formdefs: Mutex<HashMap<String, FormDef>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn records(&self) -> Vec<Record> {
        lock(&self.records).values().cloned().collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl RecordStore for MemoryStore {
    fn load_record(&self, id: &str) -> anyhow::Result<Option<Record>> {
        Ok(lock(&self.records).get(id).cloned())
    }
    fn save_record(&self, record: &Record) -> anyhow::Result<()> {
        lock(&self.records).insert(record.id.clone(), record.clone());
        Ok(())
    }
    fn load_workflow(&self, id: &str) -> anyhow::Result<Option<Workflow>> {
        Ok(lock(&self.workflows).get(id).cloned())
    }
    fn save_workflow(&self, workflow: &Workflow) -> anyhow::Result<()> {
        lock(&self.workflows).insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }
    fn load_formdef(&self, id: &str) -> anyhow::Result<Option<FormDef>> {
        Ok(lock(&self.formdefs).get(id).cloned())
    }
    fn save_formdef(&self, formdef: &FormDef) -> anyhow::Result<()> {
        lock(&self.formdefs).insert(formdef.id.clone(), formdef.clone());
        Ok(())
    }
}

/// Keeps every report and notification, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryErrorLog {
    reports: Mutex<Vec<ErrorReport>>,
    notifications: Mutex<Vec<(Vec<String>, String, String)>>,
}

impl MemoryErrorLog {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn reports(&self) -> Vec<ErrorReport> {
        lock(&self.reports).clone()
    }
    pub fn notifications(&self) -> Vec<(Vec<String>, String, String)> {
        lock(&self.notifications).clone()
    }
}

impl ErrorSink for MemoryErrorLog {
    fn record_error(&self, report: ErrorReport) {
        lock(&self.reports).push(report);
    }
    fn notify(&self, recipients: &[String], subject: &str, body: &str) {
        lock(&self.notifications).push((recipients.to_vec(), subject.to_string(), body.to_string()));
    }
}

/// Content addressed blobs: the handle is the sha256 of the bytes.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn handles(&self) -> Vec<String> {
        lock(&self.blobs).keys().cloned().collect()
    }
    /// Drops every blob not in `live`; returns how many were removed.
    pub fn retain(&self, live: &std::collections::BTreeSet<String>) -> usize {
        let mut blobs = lock(&self.blobs);
        let before = blobs.len();
        blobs.retain(|handle, _| live.contains(handle));
        before - blobs.len()
    }
}

impl BlobStore for MemoryBlobStore {
    fn store(&self, bytes: &[u8], _filename: &str, _content_type: &str) -> anyhow::Result<String> {
        let handle = sha256::digest(bytes);
        lock(&self.blobs).insert(handle.clone(), bytes.to_vec());
        Ok(handle)
    }
    fn retrieve(&self, handle: &str) -> anyhow::Result<Vec<u8>> {
        lock(&self.blobs)
            .get(handle)
            .cloned()
            .with_context(|| format!("unknown blob handle {handle}"))
    }
}

/// Answers requests from a table keyed by url prefix and keeps every request it saw.
#[derive(Debug, Default)]
pub struct ScriptedHttpClient {
    routes: Mutex<Vec<(String, Result<HttpResponse, ConnectionError>)>>,
    seen: Mutex<Vec<HttpRequest>>,
}

impl ScriptedHttpClient {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn route(&self, url_prefix: &str, answer: Result<HttpResponse, ConnectionError>) {
        lock(&self.routes).push((url_prefix.to_string(), answer));
    }
    pub fn requests(&self) -> Vec<HttpRequest> {
        lock(&self.seen).clone()
    }
}

impl HttpClient for ScriptedHttpClient {
    fn request(&self, request: &HttpRequest) -> Result<HttpResponse, ConnectionError> {
        lock(&self.seen).push(request.clone());
        lock(&self.routes)
            .iter()
            .find(|(prefix, _)| request.url.starts_with(prefix.as_str()))
            .map(|(_, answer)| answer.clone())
            .unwrap_or_else(|| {
                Err(ConnectionError::Failed {
                    url: request.url.clone(),
                    message: "no route".into(),
                })
            })
    }
}
