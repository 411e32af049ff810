//! Deterministic fakes shared by the pipeline tests.

use crate::cache::QueryCache;
use crate::config::{PipelineConfig, SchemaConfig};
use crate::db::{DatabaseBackend, DbError, Row};
use crate::llm::models::{ChatMessage, ChatResponse, ToolCall, ToolSpec};
use crate::llm::{ChatModel, LlmError};
use crate::pipeline::SessionOrchestrator;
use crate::schema::{SchemaCache, TableInfo};
use crate::store::memory::MemoryStore;
use crate::store::Stores;
use crate::util::metrics::PipelineMetrics;
use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Replays canned responses in order and records every request.
pub struct ScriptedChat {
    script: Mutex<VecDeque<ChatResponse>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
    next_id: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedChat {
    pub fn new(script: Vec<ChatResponse>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            gate: None,
        })
    }

    /// Like `new`, but every reply waits for a permit on the returned
    /// semaphore. Requests are recorded before waiting.
    pub fn gated(script: Vec<ChatResponse>) -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let chat = Arc::new(Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            gate: Some(gate.clone()),
        });
        (chat, gate)
    }

    /// Waits until at least `count` requests have arrived.
    pub async fn wait_for_requests(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.requests.lock().unwrap().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("requests never arrived");
    }

    pub fn text(text: &str) -> ChatResponse {
        ChatResponse::Text(text.to_string())
    }

    pub fn run_query(sql: &str) -> ChatResponse {
        ChatResponse::ToolCall(ToolCall {
            id: String::new(),
            name: "run_query".to_string(),
            arguments: json!({ "sql": sql }),
        })
    }

    pub fn push(&self, response: ChatResponse) {
        self.script.lock().unwrap().push_back(response);
    }

    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().unwrap().clone()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatModel for ScriptedChat {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, messages: &[ChatMessage], _tools: &[ToolSpec]) -> Result<ChatResponse, LlmError> {
        self.requests.lock().unwrap().push(messages.to_vec());
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(ChatResponse::ToolCall(mut call)) => {
                if call.id.is_empty() {
                    call.id = format!("call_{}", self.next_id.fetch_add(1, Ordering::SeqCst));
                }
                Ok(ChatResponse::ToolCall(call))
            }
            Some(response) => Ok(response),
            None => Err(LlmError::ResponseError("script exhausted".to_string())),
        }
    }
}

/// Backend that records validate/execute calls, optionally delegating to a
/// real backend.
pub struct RecordingBackend {
    inner: Option<Arc<dyn DatabaseBackend>>,
    tables: Vec<TableInfo>,
    rows: Vec<Row>,
    failures: Vec<(String, String)>,
    validated: Mutex<Vec<String>>,
    executed: Mutex<Vec<String>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self {
            inner: None,
            tables: Vec::new(),
            rows: Vec::new(),
            failures: Vec::new(),
            validated: Mutex::new(Vec::new()),
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn wrapping(inner: Arc<dyn DatabaseBackend>) -> Self {
        Self {
            inner: Some(inner),
            ..Self::new()
        }
    }

    pub fn with_tables(mut self, tables: Vec<TableInfo>) -> Self {
        self.tables = tables;
        self
    }

    pub fn with_rows(mut self, rows: Vec<Row>) -> Self {
        self.rows = rows;
        self
    }

    /// Execution of SQL containing `needle` fails with `error`.
    pub fn failing_when(mut self, needle: &str, error: &str) -> Self {
        self.failures.push((needle.to_string(), error.to_string()));
        self
    }

    pub fn validated(&self) -> Vec<String> {
        self.validated.lock().unwrap().clone()
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl DatabaseBackend for RecordingBackend {
    fn backend_type(&self) -> &str {
        match &self.inner {
            Some(inner) => inner.backend_type(),
            None => "duckdb",
        }
    }

    async fn discover_tables(&self) -> Result<Vec<TableInfo>, DbError> {
        match &self.inner {
            Some(inner) => inner.discover_tables().await,
            None => Ok(self.tables.clone()),
        }
    }

    async fn validate_sql(&self, sql: &str) -> Result<Vec<String>, DbError> {
        self.validated.lock().unwrap().push(sql.to_string());
        match &self.inner {
            Some(inner) => inner.validate_sql(sql).await,
            None => Ok(Vec::new()),
        }
    }

    async fn execute_sql(&self, sql: &str, timeout: Duration) -> Result<Vec<Row>, DbError> {
        self.executed.lock().unwrap().push(sql.to_string());
        if let Some((_, error)) = self.failures.iter().find(|(needle, _)| sql.contains(needle.as_str())) {
            return Err(DbError::Query(error.clone()));
        }
        match &self.inner {
            Some(inner) => inner.execute_sql(sql, timeout).await,
            None => Ok(self.rows.clone()),
        }
    }
}

/// Builds rows from a JSON array of objects.
pub fn rows(value: serde_json::Value) -> Vec<Row> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_object().cloned())
                .collect()
        })
        .unwrap_or_default()
}

/// Orchestrator over in-memory stores with default settings and the query
/// cache enabled.
pub fn orchestrator(chat: Arc<ScriptedChat>, backend: Arc<dyn DatabaseBackend>) -> Arc<SessionOrchestrator> {
    orchestrator_with_timeout(chat, backend, Duration::from_secs(5))
}

pub fn orchestrator_with_timeout(
    chat: Arc<ScriptedChat>,
    backend: Arc<dyn DatabaseBackend>,
    query_timeout: Duration,
) -> Arc<SessionOrchestrator> {
    let store = Arc::new(MemoryStore::new());
    let stores = Stores {
        queries: store.clone(),
        sessions: store,
    };
    let schema = Arc::new(SchemaCache::new(backend, SchemaConfig::default(), HashMap::new()));
    Arc::new(SessionOrchestrator::new(
        schema,
        chat,
        stores,
        Some(Arc::new(QueryCache::new(Duration::from_secs(60)))),
        &PipelineConfig::default(),
        query_timeout,
        Arc::new(PipelineMetrics::new()),
    ))
}
