use crate::config::SchemaConfig;
use crate::db::{DatabaseBackend, DbError};
use crate::schema::model::{SchemaSnapshot, TableDescription, TableInfo};
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum DescriptionsError {
    #[error("failed to read descriptions file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse descriptions file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Loads `{ "Table": { "description": "...", "columns": { "col": "..." } } }`.
pub fn load_descriptions(path: &Path) -> Result<HashMap<String, TableDescription>, DescriptionsError> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// TTL cache in front of schema discovery.
pub struct SchemaCache {
    backend: Arc<dyn DatabaseBackend>,
    config: SchemaConfig,
    descriptions: HashMap<String, TableDescription>,
    snapshot: RwLock<Option<Arc<SchemaSnapshot>>>,
}

impl SchemaCache {
    pub fn new(
        backend: Arc<dyn DatabaseBackend>,
        config: SchemaConfig,
        descriptions: HashMap<String, TableDescription>,
    ) -> Self {
        Self {
            backend,
            config,
            descriptions,
            snapshot: RwLock::new(None),
        }
    }

    pub fn backend(&self) -> &Arc<dyn DatabaseBackend> {
        &self.backend
    }

    pub fn config(&self) -> &SchemaConfig {
        &self.config
    }

    fn is_fresh(&self, snapshot: &SchemaSnapshot) -> bool {
        let age = Utc::now() - snapshot.fetched_at;
        age < chrono::Duration::seconds(self.config.cache_ttl_secs as i64)
    }

    pub async fn get(&self, force_refresh: bool) -> Result<Arc<SchemaSnapshot>, DbError> {
        if !force_refresh {
            let cached = self.snapshot.read().await;
            if let Some(snapshot) = cached.as_ref().filter(|s| self.is_fresh(s)) {
                debug!("Schema cache hit ({} tables)", snapshot.tables.len());
                return Ok(snapshot.clone());
            }
        }

        let mut slot = self.snapshot.write().await;
        // a concurrent caller may have refreshed while we waited for the lock
        if !force_refresh {
            if let Some(snapshot) = slot.as_ref().filter(|s| self.is_fresh(s)) {
                return Ok(snapshot.clone());
            }
        }

        let tables = self.backend.discover_tables().await?;
        let tables = self.describe(self.filter(tables));
        let snapshot = Arc::new(SchemaSnapshot::new(tables));
        *slot = Some(snapshot.clone());

        info!(
            "Schema refreshed from {}: {} tables",
            self.backend.backend_type(),
            snapshot.tables.len()
        );
        Ok(snapshot)
    }

    /// Include list wins over exclude list; names match bare or schema-qualified.
    fn filter(&self, tables: Vec<TableInfo>) -> Vec<TableInfo> {
        let matches = |table: &TableInfo, names: &[String]| {
            names.iter().any(|n| {
                n == &table.name || n == &format!("{}.{}", table.schema_name, table.name)
            })
        };

        if !self.config.include_tables.is_empty() {
            tables
                .into_iter()
                .filter(|t| matches(t, &self.config.include_tables))
                .collect()
        } else if !self.config.exclude_tables.is_empty() {
            tables
                .into_iter()
                .filter(|t| !matches(t, &self.config.exclude_tables))
                .collect()
        } else {
            tables
        }
    }

    fn describe(&self, mut tables: Vec<TableInfo>) -> Vec<TableInfo> {
        for table in &mut tables {
            let Some(desc) = self
                .descriptions
                .get(&table.name)
                .or_else(|| self.descriptions.get(&table.qualified_name()))
            else {
                continue;
            };

            if !desc.description.is_empty() {
                table.description = desc.description.clone();
            }
            for column in &mut table.columns {
                if let Some(text) = desc.columns.get(&column.name) {
                    column.description = text.clone();
                }
            }
        }
        tables
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Row;
    use crate::schema::model::ColumnInfo;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingBackend {
        discoveries: AtomicUsize,
    }

    #[async_trait]
    impl DatabaseBackend for CountingBackend {
        fn backend_type(&self) -> &str {
            "fake"
        }

        async fn discover_tables(&self) -> Result<Vec<TableInfo>, DbError> {
            self.discoveries.fetch_add(1, Ordering::SeqCst);
            Ok(vec![
                TableInfo::new("Track", vec![ColumnInfo::new("TrackId", "INTEGER", false)]),
                TableInfo::new("Album", vec![]),
                TableInfo::new("audit_log", vec![]),
            ])
        }

        async fn validate_sql(&self, _sql: &str) -> Result<Vec<String>, DbError> {
            Ok(Vec::new())
        }

        async fn execute_sql(&self, _sql: &str, _timeout: Duration) -> Result<Vec<Row>, DbError> {
            Ok(Vec::new())
        }
    }

    fn cache_with(config: SchemaConfig) -> (Arc<CountingBackend>, SchemaCache) {
        let backend = Arc::new(CountingBackend {
            discoveries: AtomicUsize::new(0),
        });
        let cache = SchemaCache::new(backend.clone(), config, HashMap::new());
        (backend, cache)
    }

    #[tokio::test]
    async fn serves_from_cache_until_forced() {
        let (backend, cache) = cache_with(SchemaConfig::default());
        let first = cache.get(false).await.unwrap();
        let second = cache.get(false).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(backend.discoveries.load(Ordering::SeqCst), 1);

        let refreshed = cache.get(true).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &refreshed));
        assert_eq!(backend.discoveries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_ttl_always_rediscovers() {
        let (backend, cache) = cache_with(SchemaConfig {
            cache_ttl_secs: 0,
            ..SchemaConfig::default()
        });
        cache.get(false).await.unwrap();
        cache.get(false).await.unwrap();
        assert_eq!(backend.discoveries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn include_list_wins_over_exclude_list() {
        let (_, cache) = cache_with(SchemaConfig {
            include_tables: vec!["Track".into()],
            exclude_tables: vec!["Track".into()],
            ..SchemaConfig::default()
        });
        let snapshot = cache.get(false).await.unwrap();
        assert_eq!(snapshot.tables.len(), 1);
        assert_eq!(snapshot.tables[0].name, "Track");

        let (_, cache) = cache_with(SchemaConfig {
            exclude_tables: vec!["audit_log".into()],
            ..SchemaConfig::default()
        });
        let snapshot = cache.get(false).await.unwrap();
        assert!(!snapshot.has_table("audit_log"));
        assert_eq!(snapshot.tables.len(), 2);
    }

    #[tokio::test]
    async fn attaches_descriptions() {
        let backend = Arc::new(CountingBackend {
            discoveries: AtomicUsize::new(0),
        });
        let descriptions: HashMap<String, TableDescription> = serde_json::from_str(
            r#"{"Track": {"description": "Songs for sale", "columns": {"TrackId": "Primary key"}}}"#,
        )
        .unwrap();
        let cache = SchemaCache::new(backend, SchemaConfig::default(), descriptions);

        let snapshot = cache.get(false).await.unwrap();
        let track = snapshot.table("Track").unwrap();
        assert_eq!(track.description, "Songs for sale");
        assert_eq!(track.columns[0].description, "Primary key");
    }
}
