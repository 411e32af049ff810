use crate::pipeline::record::{ApprovalStatus, QueryRecord};
use crate::pipeline::simple_loop::LoopState;
use crate::pipeline::PipelineError;
use crate::store::{Checkpoint, QueryStore, SessionStore};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

/// A reviewer's verdict on a pending query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApprovalDecision {
    pub approved: bool,
    #[serde(default)]
    pub modified_sql: Option<String>,
}

impl ApprovalDecision {
    /// Modified SQL with surrounding whitespace removed, ignoring blanks.
    pub fn modified_sql(&self) -> Option<&str> {
        self.modified_sql
            .as_deref()
            .map(str::trim)
            .filter(|sql| !sql.is_empty())
    }
}

/// Parks runs whose SQL needs review and enforces the approval state machine
/// when they are picked up again.
pub struct ApprovalManager {
    queries: Arc<dyn QueryStore>,
    sessions: Arc<dyn SessionStore>,
}

impl ApprovalManager {
    pub fn new(queries: Arc<dyn QueryStore>, sessions: Arc<dyn SessionStore>) -> Self {
        Self { queries, sessions }
    }

    /// Marks the record pending and stores the loop state as the session's
    /// checkpoint, replacing any older one.
    pub async fn park(&self, record: &mut QueryRecord, state: LoopState) -> Result<(), PipelineError> {
        record.mark_pending(&state.generated_sql, state.validation_errors.clone());
        self.queries.save(record).await?;
        self.sessions
            .set_checkpoint(
                &record.session_id,
                Some(Checkpoint {
                    query_id: record.id.clone(),
                    state,
                    parked_at: Utc::now(),
                }),
            )
            .await?;
        info!(
            "Query {} awaiting approval: {}",
            record.id,
            record.validation_errors.join("; ")
        );
        Ok(())
    }

    /// The pending record plus its parked state, when the session checkpoint
    /// still belongs to it.
    pub async fn load_pending(&self, query_id: &str) -> Result<(QueryRecord, Option<LoopState>), PipelineError> {
        let record = self
            .queries
            .get(query_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("query {}", query_id)))?;

        if record.approval_status != ApprovalStatus::Pending {
            return Err(PipelineError::InvalidRequest(format!(
                "query {} is {}, only pending queries can be approved or rejected",
                query_id, record.approval_status
            )));
        }

        let state = self
            .sessions
            .get(&record.session_id)
            .await?
            .and_then(|session| session.checkpoint)
            .filter(|checkpoint| checkpoint.query_id == query_id)
            .map(|checkpoint| checkpoint.state);
        Ok((record, state))
    }

    /// Moves a pending record to `next`, refusing anything the state
    /// machine doesn't allow.
    pub fn transition(record: &mut QueryRecord, next: ApprovalStatus) -> Result<(), PipelineError> {
        if !record.approval_status.can_transition_to(next) {
            return Err(PipelineError::InvalidRequest(format!(
                "query {} cannot move from {} to {}",
                record.id, record.approval_status, next
            )));
        }
        record.approval_status = next;
        if next == ApprovalStatus::Approved {
            record.approved_at = Some(Utc::now());
        }
        Ok(())
    }

    pub async fn reject(&self, record: &mut QueryRecord) -> Result<(), PipelineError> {
        Self::transition(record, ApprovalStatus::Rejected)?;
        record.result = None;
        self.queries.save(record).await?;
        self.release(record).await?;
        info!("Query {} rejected", record.id);
        Ok(())
    }

    pub async fn approve(&self, record: &mut QueryRecord) -> Result<(), PipelineError> {
        Self::transition(record, ApprovalStatus::Approved)?;
        self.queries.save(record).await?;
        info!("Query {} approved", record.id);
        Ok(())
    }

    /// Clears the session checkpoint if it still points at this record.
    pub async fn release(&self, record: &QueryRecord) -> Result<(), PipelineError> {
        let owns_checkpoint = self
            .sessions
            .get(&record.session_id)
            .await?
            .and_then(|session| session.checkpoint)
            .is_some_and(|checkpoint| checkpoint.query_id == record.id);
        if owns_checkpoint {
            self.sessions.set_checkpoint(&record.session_id, None).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::models::ChatMessage;
    use crate::store::memory::MemoryStore;

    async fn manager() -> (ApprovalManager, Arc<MemoryStore>, String) {
        let store = Arc::new(MemoryStore::new());
        let session = SessionStore::create(store.as_ref()).await.unwrap();
        (
            ApprovalManager::new(store.clone(), store.clone()),
            store,
            session.session_id,
        )
    }

    fn parked_state(sql: &str) -> LoopState {
        LoopState {
            generated_sql: sql.to_string(),
            validation_errors: vec!["Forbidden keyword: DELETE".to_string()],
            ..LoopState::new(vec![ChatMessage::user("clean up")])
        }
    }

    #[tokio::test]
    async fn parked_state_comes_back_with_the_record() {
        let (approvals, _, session_id) = manager().await;
        let mut record = QueryRecord::new(&session_id, "clean up");
        approvals.park(&mut record, parked_state("DELETE FROM t")).await.unwrap();

        let (loaded, state) = approvals.load_pending(&record.id).await.unwrap();
        assert_eq!(loaded.approval_status, ApprovalStatus::Pending);
        assert_eq!(loaded.generated_sql, "DELETE FROM t");
        assert_eq!(state.unwrap().generated_sql, "DELETE FROM t");
    }

    #[tokio::test]
    async fn a_newer_park_replaces_the_checkpoint() {
        let (approvals, _, session_id) = manager().await;
        let mut first = QueryRecord::new(&session_id, "one");
        let mut second = QueryRecord::new(&session_id, "two");
        approvals.park(&mut first, parked_state("DELETE FROM a")).await.unwrap();
        approvals.park(&mut second, parked_state("DELETE FROM b")).await.unwrap();

        let (_, state) = approvals.load_pending(&first.id).await.unwrap();
        assert!(state.is_none());
        let (_, state) = approvals.load_pending(&second.id).await.unwrap();
        assert!(state.is_some());
    }

    #[tokio::test]
    async fn only_pending_records_can_be_decided() {
        let (approvals, _, session_id) = manager().await;
        let mut record = QueryRecord::new(&session_id, "clean up");
        approvals.park(&mut record, parked_state("DELETE FROM t")).await.unwrap();
        approvals.reject(&mut record).await.unwrap();
        assert_eq!(record.approval_status, ApprovalStatus::Rejected);

        let err = approvals.load_pending(&record.id).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRequest(_)));
        let err = approvals.load_pending("missing").await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
        assert!(ApprovalManager::transition(&mut record, ApprovalStatus::Executed).is_err());
    }

    #[test]
    fn blank_modified_sql_is_ignored() {
        let decision = ApprovalDecision {
            approved: true,
            modified_sql: Some("   ".to_string()),
        };
        assert_eq!(decision.modified_sql(), None);
    }
}
