use crate::cache::QueryCache;
use crate::config::PipelineConfig;
use crate::llm::models::{ChatMessage, ToolCall};
use crate::llm::{prompts, ChatModel};
use crate::pipeline::analytical::AnalyticalPipeline;
use crate::pipeline::approval::{ApprovalDecision, ApprovalManager};
use crate::pipeline::classifier::QueryClassifier;
use crate::pipeline::events::{EventSink, PipelineEvent};
use crate::pipeline::executor::SqlGate;
use crate::pipeline::record::{ApprovalStatus, QueryRecord, QueryType};
use crate::pipeline::simple_loop::{LoopOutcome, LoopState, SimpleQueryLoop};
use crate::pipeline::PipelineError;
use crate::schema::render::{fit_history, render_budgeted, ContextBudget};
use crate::schema::{SchemaCache, SchemaSnapshot, TableSelector};
use crate::store::{QueryStore, SessionState, SessionStore, Stores};
use crate::util::metrics::{Counter, PipelineMetrics};
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Runs questions for conversations. Turns within one session are
/// serialized; different sessions run in parallel.
pub struct SessionOrchestrator {
    schema: Arc<SchemaCache>,
    selector: TableSelector,
    budget: ContextBudget,
    llm: Arc<dyn ChatModel>,
    gate: Arc<SqlGate>,
    classifier: QueryClassifier,
    simple: SimpleQueryLoop,
    analytical: AnalyticalPipeline,
    approvals: ApprovalManager,
    queries: Arc<dyn QueryStore>,
    sessions: Arc<dyn SessionStore>,
    cache: Option<Arc<QueryCache>>,
    metrics: Arc<PipelineMetrics>,
    top_k: usize,
    session_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionOrchestrator {
    pub fn new(
        schema: Arc<SchemaCache>,
        llm: Arc<dyn ChatModel>,
        stores: Stores,
        cache: Option<Arc<QueryCache>>,
        config: &PipelineConfig,
        query_timeout: Duration,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let schema_config = schema.config();
        let selector = TableSelector::new(
            schema_config.selection_mode,
            schema_config.max_selected_tables,
        );
        let budget = ContextBudget::from_config(schema_config);
        let gate = Arc::new(SqlGate::new(schema.backend().clone(), query_timeout));

        Self {
            selector,
            budget,
            classifier: QueryClassifier::new(llm.clone()),
            simple: SimpleQueryLoop::new(llm.clone(), gate.clone(), config, metrics.clone()),
            analytical: AnalyticalPipeline::new(llm.clone(), gate.clone(), config),
            approvals: ApprovalManager::new(stores.queries.clone(), stores.sessions.clone()),
            queries: stores.queries,
            sessions: stores.sessions,
            schema,
            llm,
            gate,
            cache,
            metrics,
            top_k: config.top_k,
            session_locks: DashMap::new(),
        }
    }

    pub fn cache(&self) -> Option<&Arc<QueryCache>> {
        self.cache.as_ref()
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn schema(&self) -> &Arc<SchemaCache> {
        &self.schema
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.session_locks
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Drops the session's lock entry once no other turn holds or waits on it.
    fn release_session_lock(&self, session_id: &str, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.session_locks
            .remove_if(session_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub async fn create_session(&self) -> Result<SessionState, PipelineError> {
        let session = self.sessions.create().await?;
        info!("Created session {}", session.session_id);
        Ok(session)
    }

    async fn require_session(&self, session_id: &str) -> Result<SessionState, PipelineError> {
        self.sessions
            .get(session_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("session {}", session_id)))
    }

    /// Single-shot run without progress events.
    pub async fn submit(&self, session_id: &str, question: &str) -> Result<QueryRecord, PipelineError> {
        self.run(session_id, question, &EventSink::disabled()).await
    }

    /// Starts a run in the background and hands back its event stream. The
    /// stream ends after the `done` event.
    pub async fn stream(
        self: &Arc<Self>,
        session_id: &str,
        question: &str,
    ) -> Result<UnboundedReceiver<PipelineEvent>, PipelineError> {
        if question.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("question must not be empty".to_string()));
        }
        self.require_session(session_id).await?;

        let (events, rx) = EventSink::channel();
        let this = Arc::clone(self);
        let session_id = session_id.to_string();
        let question = question.to_string();
        tokio::spawn(async move {
            if let Err(e) = this.run(&session_id, &question, &events).await {
                error!("Streamed query in session {} failed: {}", session_id, e);
            }
        });
        Ok(rx)
    }

    /// Answers one question in a session and persists the resulting record.
    /// Pipeline faults end up as a failed record; only storage faults and
    /// bad requests surface as errors.
    pub async fn run(
        &self,
        session_id: &str,
        question: &str,
        events: &EventSink,
    ) -> Result<QueryRecord, PipelineError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(PipelineError::InvalidRequest("question must not be empty".to_string()));
        }
        self.require_session(session_id).await?;

        let lock = self.session_lock(session_id);
        let result = {
            let _turn = lock.lock().await;
            self.run_turn(session_id, question, events).await
        };
        self.release_session_lock(session_id, lock);
        result
    }

    async fn run_turn(
        &self,
        session_id: &str,
        question: &str,
        events: &EventSink,
    ) -> Result<QueryRecord, PipelineError> {
        // the previous turn is finished; reload so its record is in the history
        let session = self.require_session(session_id).await?;

        self.metrics.increment(Counter::QueriesTotal);
        let mut record = QueryRecord::new(session_id, question);
        info!("Query {} in session {}: {}", record.id, session_id, question);

        match self.drive(&mut record, &session, events).await {
            Ok(()) => {}
            Err(e @ PipelineError::Store(_)) => return Err(e),
            Err(e) => {
                error!("Query {} failed: {}", record.id, e);
                record.mark_failed(e.to_string());
            }
        }

        self.finish(record, events).await
    }

    async fn drive(
        &self,
        record: &mut QueryRecord,
        session: &SessionState,
        events: &EventSink,
    ) -> Result<(), PipelineError> {
        events.emit(PipelineEvent::SchemaDiscoveryStarted);
        let snapshot = self.schema.get(false).await?;
        events.emit(PipelineEvent::SchemaDiscovered {
            table_count: snapshot.tables.len(),
        });

        // follow-ups depend on the conversation, so only opening turns are cached
        let schema_hash = snapshot.schema_hash();
        let cache = self.cache.as_ref().filter(|_| session.query_ids.is_empty());
        if let Some(cache) = cache {
            if let Some(hit) = cache.get(&record.question, &schema_hash).await {
                info!("Answered query {} from cache", record.id);
                record.query_type = hit.query_type;
                record.generated_sql = hit.sql;
                record.mark_executed(Some(hit.result), Some(hit.answer));
                return Ok(());
            }
        }

        let question = record.question.clone();
        record.query_type = self.classifier.classify(&question, &snapshot, events).await;

        let selected = self
            .selector
            .select(&question, &snapshot.tables, self.llm.as_ref())
            .await;
        debug!("Using {} of {} tables", selected.len(), snapshot.tables.len());
        let schema_context = render_budgeted(&selected, self.budget.schema_tokens);
        let history = self.history_lines(session).await?;

        match record.query_type {
            QueryType::Simple => {
                let mut state = LoopState::new(vec![
                    ChatMessage::system(self.system_prompt(&schema_context, &history)),
                    ChatMessage::user(question.as_str()),
                ]);
                let outcome = self.simple.run(&mut state, &question, &snapshot, events).await;
                self.settle(record, state, outcome).await?;

                if let (Some(cache), ApprovalStatus::Executed) = (cache, record.approval_status) {
                    if let (Some(result), Some(answer)) = (&record.result, &record.answer) {
                        cache
                            .put(&question, &schema_hash, &record.generated_sql, result.clone(), answer, QueryType::Simple)
                            .await;
                    }
                }
            }
            QueryType::Analytical => {
                let context = with_history(schema_context, &history);
                let outcome = self.analytical.run(&question, &snapshot, &context, events).await?;

                record.generated_sql = outcome
                    .steps
                    .iter()
                    .filter_map(|s| s.sql.as_deref())
                    .collect::<Vec<_>>()
                    .join(";\n");
                record.analysis_plan = Some(outcome.plan);
                record.analysis_steps = Some(outcome.steps);
                record.mark_executed(None, Some(outcome.answer));
            }
        }
        Ok(())
    }

    /// Copies a finished or suspended loop onto the record.
    async fn settle(
        &self,
        record: &mut QueryRecord,
        mut state: LoopState,
        outcome: Result<LoopOutcome, PipelineError>,
    ) -> Result<(), PipelineError> {
        let outcome = outcome?;
        record.generated_sql = state.generated_sql.clone();
        match outcome {
            LoopOutcome::Answered => {
                record.validation_errors = state.validation_errors.clone();
                record.mark_executed(state.result.take(), state.answer.take());
            }
            LoopOutcome::Failed => {
                let error = state
                    .error
                    .take()
                    .unwrap_or_else(|| "query execution failed".to_string());
                record.mark_failed(error);
            }
            LoopOutcome::Suspended => {
                self.approvals.park(record, state).await?;
            }
        }
        Ok(())
    }

    async fn finish(&self, record: QueryRecord, events: &EventSink) -> Result<QueryRecord, PipelineError> {
        self.queries.save(&record).await?;
        self.sessions.append_query(&record.session_id, &record.id).await?;

        match record.approval_status {
            ApprovalStatus::Executed => self.metrics.increment(Counter::QueriesExecuted),
            ApprovalStatus::Failed => self.metrics.increment(Counter::QueriesFailed),
            ApprovalStatus::Pending => self.metrics.increment(Counter::QueriesPending),
            ApprovalStatus::Rejected => self.metrics.increment(Counter::QueriesRejected),
            ApprovalStatus::Approved => {}
        }
        info!(
            "Query {} finished as {} ({} rows)",
            record.id,
            record.approval_status,
            record.row_count()
        );

        events.emit(PipelineEvent::Done {
            record: Box::new(record.clone()),
        });
        Ok(record)
    }

    /// Applies a reviewer's decision to a pending query and, when approved,
    /// continues the parked run from its tool call.
    pub async fn resume(
        &self,
        query_id: &str,
        decision: ApprovalDecision,
        events: &EventSink,
    ) -> Result<QueryRecord, PipelineError> {
        let session_id = self
            .queries
            .get(query_id)
            .await?
            .map(|record| record.session_id)
            .ok_or_else(|| PipelineError::NotFound(format!("query {}", query_id)))?;

        let lock = self.session_lock(&session_id);
        let result = {
            let _turn = lock.lock().await;
            self.resume_turn(query_id, decision, events).await
        };
        self.release_session_lock(&session_id, lock);
        result
    }

    async fn resume_turn(
        &self,
        query_id: &str,
        decision: ApprovalDecision,
        events: &EventSink,
    ) -> Result<QueryRecord, PipelineError> {
        let (mut record, parked) = self.approvals.load_pending(query_id).await?;

        if !decision.approved {
            self.approvals.reject(&mut record).await?;
            return self.finish(record, events).await;
        }

        let snapshot = self.schema.get(false).await?;
        let mut state = match parked {
            Some(state) => state,
            None => {
                info!("No checkpoint for query {}, rebuilding its state", record.id);
                self.rebuild_state(&record, &snapshot)
            }
        };

        if let Some(sql) = decision.modified_sql() {
            let errors = self.gate.validate(sql, &snapshot).await?;
            state.apply_modified_sql(sql);
            if !errors.is_empty() {
                info!("Modified SQL for query {} still fails validation", record.id);
                events.emit(PipelineEvent::ValidationFailed {
                    errors: errors.clone(),
                });
                state.validation_errors = errors;
                self.approvals.park(&mut record, state).await?;
                events.emit(PipelineEvent::Done {
                    record: Box::new(record.clone()),
                });
                return Ok(record);
            }
            state.validation_errors.clear();
            events.emit(PipelineEvent::ValidationPassed);
        }

        self.approvals.approve(&mut record).await?;
        state.approved = true;

        let question = record.question.clone();
        let outcome = self.simple.run(&mut state, &question, &snapshot, events).await;
        match self.settle(&mut record, state, outcome).await {
            Ok(()) => {}
            Err(e @ PipelineError::Store(_)) => return Err(e),
            Err(e) => {
                error!("Approved query {} failed: {}", record.id, e);
                record.mark_failed(e.to_string());
            }
        }
        if decision.modified_sql().is_some() {
            record.validation_errors.clear();
        }

        self.approvals.release(&record).await?;
        self.finish(record, events).await
    }

    /// Loop state for a pending record whose checkpoint was replaced by a
    /// later one in the same session.
    fn rebuild_state(&self, record: &QueryRecord, snapshot: &SchemaSnapshot) -> LoopState {
        let schema_context = render_budgeted(&snapshot.tables, self.budget.schema_tokens);
        let call = ToolCall {
            id: format!("call_{}", record.id),
            name: prompts::RUN_QUERY_TOOL.to_string(),
            arguments: json!({ "sql": record.generated_sql }),
        };
        let mut state = LoopState::new(vec![
            ChatMessage::system(self.system_prompt(&schema_context, &[])),
            ChatMessage::user(record.question.as_str()),
            ChatMessage::assistant_tool_call(call.clone()),
        ]);
        state.generated_sql = record.generated_sql.clone();
        state.validation_errors = record.validation_errors.clone();
        state.pending_call = Some(call);
        state
    }

    fn system_prompt(&self, schema_context: &str, history: &[String]) -> String {
        let prompt = prompts::sql_agent_system_prompt(self.gate.dialect(), self.top_k, schema_context);
        with_history(prompt, history)
    }

    async fn history_lines(&self, session: &SessionState) -> Result<Vec<String>, PipelineError> {
        let mut lines = Vec::with_capacity(session.query_ids.len());
        for id in &session.query_ids {
            if let Some(record) = self.queries.get(id).await? {
                lines.push(record.history_line());
            }
        }
        Ok(fit_history(&lines, self.budget.history_tokens))
    }

    pub async fn get_query(&self, query_id: &str) -> Result<QueryRecord, PipelineError> {
        self.queries
            .get(query_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("query {}", query_id)))
    }

    /// The session's records in submission order.
    pub async fn session_history(&self, session_id: &str) -> Result<Vec<QueryRecord>, PipelineError> {
        let session = self.require_session(session_id).await?;
        let mut records = Vec::with_capacity(session.query_ids.len());
        for id in &session.query_ids {
            if let Some(record) = self.queries.get(id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// One page of all records, newest first, plus the total count.
    pub async fn history(&self, limit: usize, offset: usize) -> Result<(Vec<QueryRecord>, usize), PipelineError> {
        let records = self.queries.list(limit, offset).await?;
        let total = self.queries.count().await?;
        Ok((records, total))
    }

    pub async fn list_sessions(&self, limit: usize, offset: usize) -> Result<Vec<SessionState>, PipelineError> {
        Ok(self.sessions.list(limit, offset).await?)
    }
}

fn with_history(mut context: String, history: &[String]) -> String {
    if !history.is_empty() {
        context.push_str("\n\n### Conversation so far:\n");
        context.push_str(&history.join("\n\n"));
    }
    context
}
