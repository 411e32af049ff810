pub mod db_pool;
pub mod duckdb_backend;

use crate::config::DatabaseConfig;
use crate::schema::model::TableInfo;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// One result row: column name to JSON scalar.
pub type Row = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database connection error: {0}")]
    Connection(String),
    #[error("{0}")]
    Query(String),
    #[error("query timed out after {0:?}")]
    Timeout(Duration),
    #[error("SQL rejected by read-only guard: {}", .0.join("; "))]
    Rejected(Vec<String>),
    #[error("database task failed: {0}")]
    Task(String),
    #[error("unsupported database backend: {0}")]
    Unsupported(String),
}

/// Capability contract every database backend satisfies.
#[async_trait]
pub trait DatabaseBackend: Send + Sync {
    /// Dialect name given to the LLM, e.g. "duckdb".
    fn backend_type(&self) -> &str;

    async fn discover_tables(&self) -> Result<Vec<TableInfo>, DbError>;

    /// Dry-run the statement (bind/plan only). Returns errors, empty when valid.
    async fn validate_sql(&self, sql: &str) -> Result<Vec<String>, DbError>;

    /// Execute a read-only statement, cancelled after `timeout`.
    async fn execute_sql(&self, sql: &str, timeout: Duration) -> Result<Vec<Row>, DbError>;
}

/// Builds the backend selected by `database.backend`.
pub fn create_backend(config: &DatabaseConfig) -> Result<Arc<dyn DatabaseBackend>, DbError> {
    match config.backend.as_str() {
        "duckdb" => Ok(Arc::new(duckdb_backend::DuckDbBackend::new(config)?)),
        other => Err(DbError::Unsupported(other.to_string())),
    }
}
