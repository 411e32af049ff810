use crate::db::{DatabaseBackend, DbError, Row};
use crate::schema::SchemaSnapshot;
use crate::sql::ReadOnlyGuard;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// The only path from the pipeline to the database. Every statement passes
/// the read-only guard immediately before it runs.
pub struct SqlGate {
    guard: ReadOnlyGuard,
    backend: Arc<dyn DatabaseBackend>,
    timeout: Duration,
}

impl SqlGate {
    pub fn new(backend: Arc<dyn DatabaseBackend>, timeout: Duration) -> Self {
        Self {
            guard: ReadOnlyGuard::new(),
            backend,
            timeout,
        }
    }

    pub fn dialect(&self) -> &str {
        self.backend.backend_type()
    }

    /// Guard violations, then tables missing from the snapshot, then the
    /// backend dry run. Later stages only run when earlier ones are clean.
    pub async fn validate(&self, sql: &str, snapshot: &SchemaSnapshot) -> Result<Vec<String>, DbError> {
        let violations = self.guard.check(sql);
        if !violations.is_empty() {
            debug!("Guard rejected SQL: {:?}", violations);
            return Ok(violations);
        }

        let unknown: Vec<String> = self
            .guard
            .referenced_tables(sql)
            .into_iter()
            .filter(|t| !snapshot.has_table(t))
            .map(|t| format!("no such table: {}", t))
            .collect();
        if !unknown.is_empty() {
            return Ok(unknown);
        }

        self.backend.validate_sql(sql).await
    }

    pub async fn execute(&self, sql: &str) -> Result<Vec<Row>, DbError> {
        let violations = self.guard.check(sql);
        if !violations.is_empty() {
            warn!("Refusing to execute SQL that fails the read-only guard");
            return Err(DbError::Rejected(violations));
        }
        self.backend.execute_sql(sql, self.timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::RecordingBackend;
    use crate::schema::{ColumnInfo, TableInfo};

    fn snapshot() -> SchemaSnapshot {
        SchemaSnapshot::new(vec![TableInfo::new(
            "Track",
            vec![ColumnInfo::new("TrackId", "INTEGER", false)],
        )])
    }

    #[tokio::test]
    async fn unknown_tables_are_reported_by_name() {
        let backend = Arc::new(RecordingBackend::new());
        let gate = SqlGate::new(backend.clone(), Duration::from_secs(1));

        let errors = gate
            .validate("SELECT * FROM nonexistent_table", &snapshot())
            .await
            .unwrap();
        assert_eq!(errors, vec!["no such table: nonexistent_table"]);
        // the dry run is skipped once a static check has failed
        assert!(backend.validated().is_empty());
    }

    #[tokio::test]
    async fn clean_sql_reaches_the_backend_dry_run() {
        let backend = Arc::new(RecordingBackend::new());
        let gate = SqlGate::new(backend.clone(), Duration::from_secs(1));
        let errors = gate.validate("SELECT COUNT(*) FROM Track", &snapshot()).await.unwrap();
        assert!(errors.is_empty());
        assert_eq!(backend.validated(), vec!["SELECT COUNT(*) FROM Track"]);
    }

    #[tokio::test]
    async fn execute_never_forwards_guarded_sql() {
        let backend = Arc::new(RecordingBackend::new());
        let gate = SqlGate::new(backend.clone(), Duration::from_secs(1));
        let err = gate.execute("DROP TABLE Track").await.unwrap_err();
        assert!(matches!(err, DbError::Rejected(_)));
        assert!(backend.executed().is_empty());
    }
}
