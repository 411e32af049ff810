pub mod analytical;
pub mod approval;
pub mod classifier;
pub mod events;
pub mod executor;
pub mod orchestrator;
pub mod record;
pub mod result_validator;
pub mod simple_loop;
#[cfg(test)]
pub mod testing;

pub use events::{EventSink, PipelineEvent};
pub use orchestrator::SessionOrchestrator;
pub use record::{ApprovalStatus, QueryRecord, QueryType};

use crate::db::DbError;
use crate::llm::LlmError;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("no final answer after {0} tool calls")]
    IterationLimit(u32),
}

impl PipelineError {
    /// Caller mistakes, as opposed to faults inside the pipeline.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PipelineError::NotFound(_) | PipelineError::InvalidRequest(_)
        )
    }
}
