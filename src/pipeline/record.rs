use crate::db::Row;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Executed,
    Failed,
}

impl ApprovalStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ApprovalStatus::Rejected | ApprovalStatus::Executed | ApprovalStatus::Failed
        )
    }

    /// pending -> approved | rejected, approved -> executed | failed.
    pub fn can_transition_to(self, next: ApprovalStatus) -> bool {
        use ApprovalStatus::*;
        matches!(
            (self, next),
            (Pending, Approved) | (Pending, Rejected) | (Approved, Executed) | (Approved, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Executed => "executed",
            ApprovalStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    #[default]
    Simple,
    Analytical,
}

/// Outcome of one analytical plan step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisStep {
    pub index: usize,
    pub description: String,
    #[serde(default)]
    pub purpose: String,
    pub sql: Option<String>,
    pub result: Option<Vec<Row>>,
    pub row_count: usize,
    pub error: Option<String>,
}

impl AnalysisStep {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.result.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub id: String,
    pub session_id: String,
    pub question: String,
    pub created_at: DateTime<Utc>,
    pub generated_sql: String,
    pub validation_errors: Vec<String>,
    pub approval_status: ApprovalStatus,
    pub result: Option<Vec<Row>>,
    pub answer: Option<String>,
    pub error: Option<String>,
    pub query_type: QueryType,
    pub analysis_plan: Option<Vec<String>>,
    pub analysis_steps: Option<Vec<AnalysisStep>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
}

impl QueryRecord {
    /// A fresh record. Its first settled status is assigned by the run that
    /// owns it; the transition rules apply once it has been stored as pending.
    pub fn new(session_id: &str, question: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            question: question.to_string(),
            created_at: Utc::now(),
            generated_sql: String::new(),
            validation_errors: Vec::new(),
            approval_status: ApprovalStatus::Pending,
            result: None,
            answer: None,
            error: None,
            query_type: QueryType::Simple,
            analysis_plan: None,
            analysis_steps: None,
            approved_at: None,
            executed_at: None,
        }
    }

    pub fn row_count(&self) -> usize {
        self.result.as_ref().map_or(0, Vec::len)
    }

    pub fn mark_executed(&mut self, result: Option<Vec<Row>>, answer: Option<String>) {
        self.approval_status = ApprovalStatus::Executed;
        self.result = result;
        self.answer = answer;
        self.error = None;
        self.executed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: String) {
        self.approval_status = ApprovalStatus::Failed;
        self.result = None;
        self.error = Some(error);
    }

    pub fn mark_pending(&mut self, sql: &str, violations: Vec<String>) {
        self.approval_status = ApprovalStatus::Pending;
        self.generated_sql = sql.to_string();
        self.validation_errors = violations;
        self.result = None;
    }

    /// One-line summary used as conversation history for later turns.
    pub fn history_line(&self) -> String {
        let mut line = format!("Q: {}", self.question);
        if !self.generated_sql.is_empty() {
            line.push_str(&format!("\nSQL: {}", self.generated_sql));
        }
        match (&self.answer, &self.error) {
            (Some(answer), _) => line.push_str(&format!("\nA: {}", answer)),
            (None, Some(error)) => line.push_str(&format!("\nError: {}", error)),
            _ => line.push_str(&format!("\nStatus: {}", self.approval_status)),
        }
        line
    }
}
