use crate::pipeline::record::{QueryRecord, QueryType};
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

/// One pipeline transition. Serialized with an `event` tag in snake_case.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    SchemaDiscoveryStarted,
    SchemaDiscovered { table_count: usize },
    ClassifyingQuery,
    QueryClassified { query_type: QueryType },
    LlmGenerationStarted,
    SqlGenerated { sql: String },
    ValidationPassed,
    ValidationFailed { errors: Vec<String> },
    QueryExecutionStarted,
    QueryExecuted { row_count: usize },
    QueryExecutionFailed { error: String },
    SelfCorrectionTriggered { warnings: Vec<String> },
    AnswerGenerated { answer: String },
    PlanningAnalysis,
    AnalysisPlanCreated { steps: Vec<String>, step_count: usize },
    PlanStepStarted { step_index: usize, description: String },
    PlanStepSqlGenerated { step_index: usize, sql: String },
    PlanStepExecuted { step_index: usize, row_count: usize },
    PlanStepFailed { step_index: usize, error: String },
    AnalysisSynthesisStarted,
    AnalysisComplete { answer: String },
    AnalysisValidationWarning { warnings: Vec<String> },
    AnalysisValidationPassed,
    Done { record: Box<QueryRecord> },
}

impl PipelineEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            PipelineEvent::SchemaDiscoveryStarted => "schema_discovery_started",
            PipelineEvent::SchemaDiscovered { .. } => "schema_discovered",
            PipelineEvent::ClassifyingQuery => "classifying_query",
            PipelineEvent::QueryClassified { .. } => "query_classified",
            PipelineEvent::LlmGenerationStarted => "llm_generation_started",
            PipelineEvent::SqlGenerated { .. } => "sql_generated",
            PipelineEvent::ValidationPassed => "validation_passed",
            PipelineEvent::ValidationFailed { .. } => "validation_failed",
            PipelineEvent::QueryExecutionStarted => "query_execution_started",
            PipelineEvent::QueryExecuted { .. } => "query_executed",
            PipelineEvent::QueryExecutionFailed { .. } => "query_execution_failed",
            PipelineEvent::SelfCorrectionTriggered { .. } => "self_correction_triggered",
            PipelineEvent::AnswerGenerated { .. } => "answer_generated",
            PipelineEvent::PlanningAnalysis => "planning_analysis",
            PipelineEvent::AnalysisPlanCreated { .. } => "analysis_plan_created",
            PipelineEvent::PlanStepStarted { .. } => "plan_step_started",
            PipelineEvent::PlanStepSqlGenerated { .. } => "plan_step_sql_generated",
            PipelineEvent::PlanStepExecuted { .. } => "plan_step_executed",
            PipelineEvent::PlanStepFailed { .. } => "plan_step_failed",
            PipelineEvent::AnalysisSynthesisStarted => "analysis_synthesis_started",
            PipelineEvent::AnalysisComplete { .. } => "analysis_complete",
            PipelineEvent::AnalysisValidationWarning { .. } => "analysis_validation_warning",
            PipelineEvent::AnalysisValidationPassed => "analysis_validation_passed",
            PipelineEvent::Done { .. } => "done",
        }
    }
}

/// Where a run reports its progress. A disabled sink drops everything.
#[derive(Clone, Default)]
pub struct EventSink {
    tx: Option<UnboundedSender<PipelineEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: PipelineEvent) {
        debug!("pipeline event: {}", event.event_type());
        if let Some(tx) = &self.tx {
            // receiver gone means the client disconnected; the run still completes
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_tag_matches_event_type() {
        let events = vec![
            PipelineEvent::SchemaDiscovered { table_count: 3 },
            PipelineEvent::LlmGenerationStarted,
            PipelineEvent::PlanStepSqlGenerated {
                step_index: 1,
                sql: "SELECT 1".into(),
            },
            PipelineEvent::Done {
                record: Box::new(QueryRecord::new("s", "q")),
            },
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["event"], event.event_type());
        }

        let json = serde_json::to_value(PipelineEvent::QueryClassified {
            query_type: QueryType::Analytical,
        })
        .unwrap();
        assert_eq!(json["query_type"], "analytical");
    }
}
