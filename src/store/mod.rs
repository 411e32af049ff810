pub mod duckdb_store;
pub mod memory;

use crate::config::StorageConfig;
use crate::pipeline::record::QueryRecord;
use crate::pipeline::simple_loop::LoopState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Database(String),
    #[error("failed to serialize stored data: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0} not found")]
    NotFound(String),
}

/// Everything needed to continue a run parked for approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub query_id: String,
    pub state: LoopState,
    pub parked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub query_ids: Vec<String>,
    pub checkpoint: Option<Checkpoint>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl SessionState {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            query_ids: Vec::new(),
            checkpoint: None,
            created_at: now,
            last_activity: now,
        }
    }

    fn append(&mut self, query_id: &str) {
        if !self.query_ids.iter().any(|id| id == query_id) {
            self.query_ids.push(query_id.to_string());
        }
        self.last_activity = Utc::now();
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
pub trait QueryStore: Send + Sync {
    /// Insert or overwrite by record id.
    async fn save(&self, record: &QueryRecord) -> Result<(), StoreError>;
    async fn get(&self, query_id: &str) -> Result<Option<QueryRecord>, StoreError>;
    /// Newest first.
    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<QueryRecord>, StoreError>;
    async fn count(&self) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self) -> Result<SessionState, StoreError>;
    async fn get(&self, session_id: &str) -> Result<Option<SessionState>, StoreError>;
    async fn append_query(&self, session_id: &str, query_id: &str) -> Result<(), StoreError>;
    /// Replaces the session's checkpoint; `None` clears it.
    async fn set_checkpoint(
        &self,
        session_id: &str,
        checkpoint: Option<Checkpoint>,
    ) -> Result<(), StoreError>;
    /// Most recently active first.
    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<SessionState>, StoreError>;
}

pub struct Stores {
    pub queries: Arc<dyn QueryStore>,
    pub sessions: Arc<dyn SessionStore>,
}

/// Builds the stores selected by `storage.backend`.
pub fn create_stores(config: &StorageConfig) -> Result<Stores, StoreError> {
    match config.backend.as_str() {
        "memory" => {
            info!("Using in-memory query and session stores");
            let store = Arc::new(memory::MemoryStore::new());
            Ok(Stores {
                queries: store.clone(),
                sessions: store,
            })
        }
        "duckdb" => {
            info!("Using DuckDB stores at {}", config.path);
            let store = Arc::new(duckdb_store::DuckDbStore::open(&config.path)?);
            Ok(Stores {
                queries: store.clone(),
                sessions: store,
            })
        }
        other => Err(StoreError::Database(format!(
            "unsupported storage backend: {}",
            other
        ))),
    }
}
