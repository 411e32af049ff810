use crate::config::DatabaseConfig;
use crate::db::db_pool::{build_pool, DuckDBConnectionManager};
use crate::db::{DatabaseBackend, DbError, Row};
use crate::schema::model::{ColumnInfo, TableInfo};
use crate::sql::ReadOnlyGuard;
use async_trait::async_trait;
use duckdb::types::Value as DuckValue;
use r2d2::Pool;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub struct DuckDbBackend {
    pool: Pool<DuckDBConnectionManager>,
    guard: ReadOnlyGuard,
    max_rows: usize,
}

impl DuckDbBackend {
    pub fn new(config: &DatabaseConfig) -> Result<Self, DbError> {
        info!(
            "Initializing DuckDB connection pool for {}",
            config.connection_string
        );
        let pool = build_pool(&config.connection_string, config.pool_size as u32)?;
        Ok(Self::with_pool(pool, config.max_result_rows))
    }

    pub fn with_pool(pool: Pool<DuckDBConnectionManager>, max_rows: usize) -> Self {
        Self {
            pool,
            guard: ReadOnlyGuard::new(),
            max_rows,
        }
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<DuckDBConnectionManager> {
        &self.pool
    }
}

#[async_trait]
impl DatabaseBackend for DuckDbBackend {
    fn backend_type(&self) -> &str {
        "duckdb"
    }

    async fn discover_tables(&self) -> Result<Vec<TableInfo>, DbError> {
        let pool = self.pool.clone();
        let guard = self.guard;

        let tables = tokio::task::spawn_blocking(move || -> Result<Vec<TableInfo>, DbError> {
            let conn = pool.get().map_err(|e| DbError::Connection(e.to_string()))?;

            let mut stmt = conn
                .prepare(
                    "SELECT table_schema, table_name, table_type FROM information_schema.tables \
                     WHERE table_schema NOT IN ('information_schema', 'pg_catalog') \
                     ORDER BY table_schema, table_name",
                )
                .map_err(|e| DbError::Query(e.to_string()))?;
            let rows: Vec<(String, String, String)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
                .map_err(|e| DbError::Query(e.to_string()))?
                .filter_map(Result::ok)
                .collect();

            let mut tables = Vec::new();
            for (schema_name, table_name, table_type) in rows {
                // names are interpolated into PRAGMA below
                if !guard.validate_identifier(&schema_name) || !guard.validate_identifier(&table_name) {
                    warn!("Skipping table with unsupported name: {}.{}", schema_name, table_name);
                    continue;
                }

                let mut col_stmt = conn
                    .prepare(&format!("PRAGMA table_info('{}.{}')", schema_name, table_name))
                    .map_err(|e| DbError::Query(e.to_string()))?;
                let columns: Vec<ColumnInfo> = col_stmt
                    .query_map([], |row| {
                        Ok(ColumnInfo {
                            name: row.get::<_, String>(1)?,
                            data_type: row.get::<_, String>(2)?,
                            nullable: !row.get::<_, bool>(3)?,
                            description: String::new(),
                        })
                    })
                    .map_err(|e| DbError::Query(e.to_string()))?
                    .filter_map(Result::ok)
                    .collect();

                let mut table = TableInfo::new(&table_name, columns);
                table.schema_name = schema_name;
                table.table_type = if table_type == "VIEW" {
                    "VIEW".to_string()
                } else {
                    "TABLE".to_string()
                };
                tables.push(table);
            }

            Ok(tables)
        })
        .await
        .map_err(|e| DbError::Task(e.to_string()))??;

        info!("Discovered {} tables in DuckDB", tables.len());
        Ok(tables)
    }

    async fn validate_sql(&self, sql: &str) -> Result<Vec<String>, DbError> {
        let violations = self.guard.check(sql);
        if !violations.is_empty() {
            return Ok(violations);
        }

        let pool = self.pool.clone();
        let sql = sql.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<String>, DbError> {
            let conn = pool.get().map_err(|e| DbError::Connection(e.to_string()))?;
            // binding resolves tables and columns without running the statement
            match conn.prepare(&sql) {
                Ok(_) => Ok(Vec::new()),
                Err(e) => Ok(vec![e.to_string()]),
            }
        })
        .await
        .map_err(|e| DbError::Task(e.to_string()))?
    }

    async fn execute_sql(&self, sql: &str, timeout: Duration) -> Result<Vec<Row>, DbError> {
        let violations = self.guard.check(sql);
        if !violations.is_empty() {
            return Err(DbError::Rejected(violations));
        }

        let pool = self.pool.clone();
        let max_rows = self.max_rows;
        let sql_to_execute = sql.to_string();
        let start_time = Instant::now();

        let blocking_task = tokio::task::spawn_blocking(move || -> Result<Vec<Row>, DbError> {
            let conn = pool.get().map_err(|e| DbError::Connection(e.to_string()))?;
            let mut stmt = conn
                .prepare(&sql_to_execute)
                .map_err(|e| DbError::Query(e.to_string()))?;
            let mut rows = stmt.query([]).map_err(|e| DbError::Query(e.to_string()))?;

            let column_names = rows
                .as_ref()
                .map(|s| s.column_names())
                .ok_or_else(|| DbError::Query("statement produced no result set".to_string()))?;

            let mut results = Vec::new();
            while let Some(row) = rows.next().map_err(|e| DbError::Query(e.to_string()))? {
                if results.len() >= max_rows {
                    break;
                }
                let mut record = Row::new();
                for (i, name) in column_names.iter().enumerate() {
                    let value: DuckValue = row.get(i).map_err(|e| DbError::Query(e.to_string()))?;
                    record.insert(name.clone(), duck_value_to_json(value));
                }
                results.push(record);
            }
            Ok(results)
        });

        let rows = match tokio::time::timeout(timeout, blocking_task).await {
            Err(_) => {
                warn!("Query exceeded {:?} timeout: {}", timeout, sql);
                return Err(DbError::Timeout(timeout));
            }
            Ok(Err(join_err)) => return Err(DbError::Task(join_err.to_string())),
            Ok(Ok(result)) => result?,
        };

        debug!(
            "Query executed successfully. Row count: {}, Execution time: {}ms",
            rows.len(),
            start_time.elapsed().as_millis()
        );
        Ok(rows)
    }
}

fn duck_value_to_json(value: DuckValue) -> Value {
    match value {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(b) => Value::Bool(b),
        DuckValue::TinyInt(v) => Value::from(v),
        DuckValue::SmallInt(v) => Value::from(v),
        DuckValue::Int(v) => Value::from(v),
        DuckValue::BigInt(v) => Value::from(v),
        DuckValue::HugeInt(v) => i64::try_from(v)
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(v.to_string())),
        DuckValue::UTinyInt(v) => Value::from(v),
        DuckValue::USmallInt(v) => Value::from(v),
        DuckValue::UInt(v) => Value::from(v),
        DuckValue::UBigInt(v) => Value::from(v),
        DuckValue::Float(v) => Value::from(v as f64),
        DuckValue::Double(v) => Value::from(v),
        DuckValue::Decimal(d) => {
            let text = d.to_string();
            text.parse::<f64>()
                .map(Value::from)
                .unwrap_or(Value::String(text))
        }
        DuckValue::Text(s) => Value::String(s),
        DuckValue::Enum(s) => Value::String(s),
        other => Value::String(format!("{:?}", other)),
    }
}
