use crate::pipeline::record::QueryRecord;
use crate::store::{Checkpoint, QueryStore, SessionState, SessionStore, StoreError};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Process-local stores; records and sessions each have their own lock.
pub struct MemoryStore {
    records: Mutex<HashMap<String, QueryRecord>>,
    sessions: Mutex<HashMap<String, SessionState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueryStore for MemoryStore {
    async fn save(&self, record: &QueryRecord) -> Result<(), StoreError> {
        self.records
            .lock()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, query_id: &str) -> Result<Option<QueryRecord>, StoreError> {
        Ok(self.records.lock().await.get(query_id).cloned())
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<QueryRecord>, StoreError> {
        let records = self.records.lock().await;
        let mut all: Vec<&QueryRecord> = records.values().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all.into_iter().skip(offset).take(limit).cloned().collect())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.records.lock().await.len())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create(&self) -> Result<SessionState, StoreError> {
        let session = SessionState::new();
        self.sessions
            .lock()
            .await
            .insert(session.session_id.clone(), session.clone());
        Ok(session)
    }

    async fn get(&self, session_id: &str) -> Result<Option<SessionState>, StoreError> {
        Ok(self.sessions.lock().await.get(session_id).cloned())
    }

    async fn append_query(&self, session_id: &str, query_id: &str) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(format!("session {}", session_id)))?;
        session.append(query_id);
        Ok(())
    }

    async fn set_checkpoint(
        &self,
        session_id: &str,
        checkpoint: Option<Checkpoint>,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(format!("session {}", session_id)))?;
        session.checkpoint = checkpoint;
        Ok(())
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<SessionState>, StoreError> {
        let sessions = self.sessions.lock().await;
        let mut all: Vec<&SessionState> = sessions.values().collect();
        all.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(all.into_iter().skip(offset).take(limit).cloned().collect())
    }
}
