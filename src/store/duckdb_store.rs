use crate::db::db_pool::{build_pool, DuckDBConnectionManager};
use crate::pipeline::record::QueryRecord;
use crate::store::{Checkpoint, QueryStore, SessionState, SessionStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use duckdb::{params, Connection, OptionalExt};
use r2d2::Pool;
use tracing::debug;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS query_records (
    id VARCHAR PRIMARY KEY,
    session_id VARCHAR NOT NULL,
    created_at VARCHAR NOT NULL,
    payload VARCHAR NOT NULL
);
CREATE TABLE IF NOT EXISTS sessions (
    id VARCHAR PRIMARY KEY,
    last_activity VARCHAR NOT NULL,
    payload VARCHAR NOT NULL
);
";

/// Records and sessions persisted as JSON payloads in a DuckDB file.
pub struct DuckDbStore {
    pool: Pool<DuckDBConnectionManager>,
    // serializes read-modify-write cycles on session rows
    session_lock: tokio::sync::Mutex<()>,
}

fn db_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Database(e.to_string())
}

// fixed-width so lexical order matches time order
fn timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl DuckDbStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let pool = build_pool(path, 4).map_err(db_err)?;
        let conn = pool.get().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            pool,
            session_lock: tokio::sync::Mutex::new(()),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(db_err)?;
            f(&conn)
        })
        .await
        .map_err(db_err)?
    }

    async fn write_session(&self, session: SessionState) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&session)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO sessions VALUES (?, ?, ?)",
                params![session.session_id, timestamp(&session.last_activity), payload],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn read_session(&self, session_id: &str) -> Result<Option<SessionState>, StoreError> {
        let id = session_id.to_string();
        let payload: Option<String> = self
            .with_conn(move |conn| {
                conn.query_row("SELECT payload FROM sessions WHERE id = ?", params![id], |row| {
                    row.get(0)
                })
                .optional()
                .map_err(db_err)
            })
            .await?;
        Ok(payload
            .map(|p| serde_json::from_str(&p))
            .transpose()?)
    }

    async fn update_session<F>(&self, session_id: &str, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut SessionState),
    {
        let _guard = self.session_lock.lock().await;
        let mut session = self
            .read_session(session_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("session {}", session_id)))?;
        f(&mut session);
        self.write_session(session).await
    }
}

fn decode_all<T: serde::de::DeserializeOwned>(payloads: Vec<String>) -> Result<Vec<T>, StoreError> {
    payloads
        .iter()
        .map(|p| serde_json::from_str(p).map_err(StoreError::from))
        .collect()
}

#[async_trait]
impl QueryStore for DuckDbStore {
    async fn save(&self, record: &QueryRecord) -> Result<(), StoreError> {
        let payload = serde_json::to_string(record)?;
        let id = record.id.clone();
        let session_id = record.session_id.clone();
        let created_at = timestamp(&record.created_at);
        debug!("Persisting query record {}", id);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO query_records VALUES (?, ?, ?, ?)",
                params![id, session_id, created_at, payload],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn get(&self, query_id: &str) -> Result<Option<QueryRecord>, StoreError> {
        let id = query_id.to_string();
        let payload: Option<String> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT payload FROM query_records WHERE id = ?",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)
            })
            .await?;
        Ok(payload.map(|p| serde_json::from_str(&p)).transpose()?)
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<QueryRecord>, StoreError> {
        let payloads = self
            .with_conn(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT payload FROM query_records ORDER BY created_at DESC LIMIT ? OFFSET ?",
                    )
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![limit as i64, offset as i64], |row| row.get::<_, String>(0))
                    .map_err(db_err)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
            })
            .await?;
        decode_all(payloads)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let n: i64 = self
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM query_records", [], |row| row.get(0))
                    .map_err(db_err)
            })
            .await?;
        Ok(n as usize)
    }
}

#[async_trait]
impl SessionStore for DuckDbStore {
    async fn create(&self) -> Result<SessionState, StoreError> {
        let session = SessionState::new();
        self.write_session(session.clone()).await?;
        Ok(session)
    }

    async fn get(&self, session_id: &str) -> Result<Option<SessionState>, StoreError> {
        self.read_session(session_id).await
    }

    async fn append_query(&self, session_id: &str, query_id: &str) -> Result<(), StoreError> {
        self.update_session(session_id, |s| s.append(query_id)).await
    }

    async fn set_checkpoint(
        &self,
        session_id: &str,
        checkpoint: Option<Checkpoint>,
    ) -> Result<(), StoreError> {
        self.update_session(session_id, |s| s.checkpoint = checkpoint)
            .await
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<SessionState>, StoreError> {
        let payloads = self
            .with_conn(move |conn| {
                let mut stmt = conn
                    .prepare("SELECT payload FROM sessions ORDER BY last_activity DESC LIMIT ? OFFSET ?")
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![limit as i64, offset as i64], |row| row.get::<_, String>(0))
                    .map_err(db_err)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
            })
            .await?;
        decode_all(payloads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::models::ChatMessage;
    use crate::pipeline::record::ApprovalStatus;
    use crate::pipeline::simple_loop::LoopState;

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.duckdb");
        let path = path.to_str().unwrap();

        let mut record = QueryRecord::new("s1", "How many tracks?");
        record.mark_pending("DELETE FROM Track", vec!["Forbidden SQL operation: DELETE".into()]);
        let record_id = record.id.clone();

        let session_id = {
            let store = DuckDbStore::open(path).unwrap();
            let session = store.create().await.unwrap();
            store.save(&record).await.unwrap();
            store.append_query(&session.session_id, &record_id).await.unwrap();

            let state = LoopState::new(vec![ChatMessage::user("How many tracks?")]);
            store
                .set_checkpoint(
                    &session.session_id,
                    Some(Checkpoint {
                        query_id: record_id.clone(),
                        state,
                        parked_at: Utc::now(),
                    }),
                )
                .await
                .unwrap();
            session.session_id
        };

        let store = DuckDbStore::open(path).unwrap();
        let loaded = QueryStore::get(&store, &record_id).await.unwrap().unwrap();
        assert_eq!(loaded.approval_status, ApprovalStatus::Pending);
        assert_eq!(loaded.validation_errors.len(), 1);
        assert_eq!(store.count().await.unwrap(), 1);

        let session = SessionStore::get(&store, &session_id).await.unwrap().unwrap();
        assert_eq!(session.query_ids, vec![record_id.clone()]);
        assert_eq!(session.checkpoint.unwrap().query_id, record_id);
    }

    #[tokio::test]
    async fn missing_rows_are_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = DuckDbStore::open(dir.path().join("s.duckdb").to_str().unwrap()).unwrap();
        assert!(QueryStore::get(&store, "nope").await.unwrap().is_none());
        assert!(matches!(
            store.set_checkpoint("nope", None).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
