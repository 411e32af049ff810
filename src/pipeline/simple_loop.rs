use crate::config::PipelineConfig;
use crate::db::Row;
use crate::llm::models::{ChatMessage, ChatResponse, ToolCall};
use crate::llm::{prompts, ChatModel};
use crate::pipeline::events::{EventSink, PipelineEvent};
use crate::pipeline::executor::SqlGate;
use crate::pipeline::result_validator::ResultValidator;
use crate::pipeline::PipelineError;
use crate::schema::SchemaSnapshot;
use crate::util::metrics::{Counter, PipelineMetrics};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

// rows echoed back to the model per tool result
const CONTEXT_ROWS: usize = 50;

/// Everything the loop carries between iterations. Serializable so a run
/// parked for approval can be stored and picked up later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LoopState {
    pub messages: Vec<ChatMessage>,
    pub generated_sql: String,
    pub validation_errors: Vec<String>,
    pub result: Option<Vec<Row>>,
    pub answer: Option<String>,
    pub error: Option<String>,
    pub correction_attempts: u32,
    pub iterations: u32,
    /// Tool call waiting for approval.
    pub pending_call: Option<ToolCall>,
    pub approved: bool,
}

impl LoopState {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// Swaps the parked SQL for a reviewer's edit, including the tool call
    /// already in the transcript.
    pub fn apply_modified_sql(&mut self, sql: &str) {
        self.generated_sql = sql.to_string();
        let Some(call) = self.pending_call.as_mut() else {
            return;
        };
        call.arguments = json!({ "sql": sql });
        let id = call.id.clone();
        for message in self.messages.iter_mut().rev() {
            if let Some(recorded) = message.tool_call.as_mut().filter(|c| c.id == id) {
                recorded.arguments = json!({ "sql": sql });
                break;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopOutcome {
    /// The model produced its final text answer.
    Answered,
    /// SQL failed validation; `pending_call` holds it for review.
    Suspended,
    /// Execution failed; the message is in `state.error`.
    Failed,
}

/// Generate, validate, execute and self-correct until the model answers.
pub struct SimpleQueryLoop {
    llm: Arc<dyn ChatModel>,
    gate: Arc<SqlGate>,
    validator: ResultValidator,
    max_corrections: u32,
    max_iterations: u32,
    metrics: Arc<PipelineMetrics>,
}

impl SimpleQueryLoop {
    pub fn new(
        llm: Arc<dyn ChatModel>,
        gate: Arc<SqlGate>,
        config: &PipelineConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            llm,
            gate,
            validator: ResultValidator::new(config.anomaly.clone()),
            max_corrections: config.max_correction_attempts,
            max_iterations: config.max_tool_iterations.max(1),
            metrics,
        }
    }

    pub async fn run(
        &self,
        state: &mut LoopState,
        question: &str,
        snapshot: &SchemaSnapshot,
        events: &EventSink,
    ) -> Result<LoopOutcome, PipelineError> {
        if let Some(call) = state.pending_call.take() {
            info!("Resuming approved query");
            if self.execute_call(state, &call, question, events).await.is_err() {
                return Ok(LoopOutcome::Failed);
            }
        }

        let tools = [prompts::run_query_tool()];
        loop {
            if state.iterations >= self.max_iterations {
                warn!("Tool-call iteration limit ({}) reached", self.max_iterations);
                return Err(PipelineError::IterationLimit(self.max_iterations));
            }
            state.iterations += 1;

            events.emit(PipelineEvent::LlmGenerationStarted);
            let response = self.llm.chat(&state.messages, &tools).await?;

            let call = match response {
                ChatResponse::Text(answer) => {
                    debug!("Model answered after {} iterations", state.iterations);
                    state.messages.push(ChatMessage::assistant(answer.clone()));
                    state.answer = Some(answer.clone());
                    events.emit(PipelineEvent::AnswerGenerated { answer });
                    return Ok(LoopOutcome::Answered);
                }
                ChatResponse::ToolCall(call) => call,
            };

            state.messages.push(ChatMessage::assistant_tool_call(call.clone()));

            let sql = match call.str_arg("sql") {
                Some(sql) if call.name == prompts::RUN_QUERY_TOOL => sql.trim().to_string(),
                _ => {
                    warn!("Model made an unusable tool call: {}", call.name);
                    state.messages.push(ChatMessage::tool_result(
                        &call.id,
                        "Error: call run_query with a single `sql` string argument.",
                    ));
                    continue;
                }
            };

            state.generated_sql = sql.clone();
            events.emit(PipelineEvent::SqlGenerated { sql: sql.clone() });

            let errors = self.gate.validate(&sql, snapshot).await?;
            if !errors.is_empty() {
                events.emit(PipelineEvent::ValidationFailed {
                    errors: errors.clone(),
                });
                state.validation_errors = errors.clone();

                if !state.approved {
                    info!("SQL needs approval: {}", errors.join("; "));
                    state.result = None;
                    state.pending_call = Some(call);
                    return Ok(LoopOutcome::Suspended);
                }

                // already past approval; let the model fix its own query
                state.messages.push(ChatMessage::tool_result(
                    &call.id,
                    format!("Error: the query failed validation: {}", errors.join("; ")),
                ));
                continue;
            }

            events.emit(PipelineEvent::ValidationPassed);
            state.validation_errors.clear();

            if self.execute_call(state, &call, question, events).await.is_err() {
                return Ok(LoopOutcome::Failed);
            }
        }
    }

    /// Runs the call's SQL and appends the tool result. `Err` means the
    /// execution failed and the run is over.
    async fn execute_call(
        &self,
        state: &mut LoopState,
        call: &ToolCall,
        question: &str,
        events: &EventSink,
    ) -> Result<(), ()> {
        let sql = call
            .str_arg("sql")
            .map(str::to_string)
            .unwrap_or_else(|| state.generated_sql.clone());

        events.emit(PipelineEvent::QueryExecutionStarted);
        let rows = match self.gate.execute(&sql).await {
            Ok(rows) => rows,
            Err(e) => {
                let error = e.to_string();
                warn!("Query execution failed: {}", error);
                events.emit(PipelineEvent::QueryExecutionFailed {
                    error: error.clone(),
                });
                state.result = None;
                state.error = Some(error);
                return Err(());
            }
        };

        events.emit(PipelineEvent::QueryExecuted {
            row_count: rows.len(),
        });

        let mut content = rows_for_model(&rows);
        let warnings = self.validator.check(question, &sql, &rows);
        if !warnings.is_empty() {
            if state.correction_attempts < self.max_corrections {
                state.correction_attempts += 1;
                self.metrics.increment(Counter::SelfCorrections);
                info!(
                    "Self-correction {}/{}: {}",
                    state.correction_attempts,
                    self.max_corrections,
                    warnings.join("; ")
                );
                events.emit(PipelineEvent::SelfCorrectionTriggered {
                    warnings: warnings.clone(),
                });
                content.push_str(&format!(
                    "\n\nWarning: the result looks suspicious:\n- {}\nCheck the query and call run_query again with a corrected query, or answer if the result is right.",
                    warnings.join("\n- ")
                ));
            } else {
                debug!("Correction budget spent, accepting result despite: {:?}", warnings);
            }
        }

        state.generated_sql = sql;
        state.result = Some(rows);
        state.error = None;
        state.messages.push(ChatMessage::tool_result(&call.id, content));
        Ok(())
    }
}

fn rows_for_model(rows: &[Row]) -> String {
    let shown = &rows[..rows.len().min(CONTEXT_ROWS)];
    let mut text = serde_json::to_string(shown).unwrap_or_else(|_| "[]".to_string());
    if shown.len() < rows.len() {
        text.push_str(&format!("\n({} of {} rows shown)", shown.len(), rows.len()));
    }
    text
}
