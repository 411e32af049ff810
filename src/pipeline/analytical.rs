use crate::config::PipelineConfig;
use crate::db::Row;
use crate::llm::extract::{extract_json_object, extract_sql};
use crate::llm::{prompts, ChatModel};
use crate::pipeline::events::{EventSink, PipelineEvent};
use crate::pipeline::executor::SqlGate;
use crate::pipeline::record::AnalysisStep;
use crate::pipeline::PipelineError;
use crate::schema::SchemaSnapshot;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

const PREVIEW_ROWS: usize = 5;
const ANALYST_SYSTEM: &str = "You are a data analyst who explains query results clearly.";
const SQL_SYSTEM: &str = "You write SQL for one step of a data analysis.";

#[derive(Debug, Clone, Deserialize)]
pub struct PlannedStep {
    pub description: String,
    #[serde(default)]
    pub sql_hint: String,
    #[serde(default)]
    pub purpose: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisPlan {
    pub steps: Vec<PlannedStep>,
    #[serde(default)]
    pub synthesis_guidance: String,
}

impl AnalysisPlan {
    /// One step that answers the question head-on.
    fn single_step(question: &str) -> Self {
        Self {
            steps: vec![PlannedStep {
                description: question.to_string(),
                sql_hint: String::new(),
                purpose: "Answer the question directly".to_string(),
            }],
            synthesis_guidance: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub plan: Vec<String>,
    pub steps: Vec<AnalysisStep>,
    pub answer: String,
    /// Warnings left on the accepted answer.
    pub warnings: Vec<String>,
}

/// Plan, run every step, synthesize, then check the synthesis and revise it
/// a bounded number of times.
pub struct AnalyticalPipeline {
    llm: Arc<dyn ChatModel>,
    gate: Arc<SqlGate>,
    max_steps: usize,
    max_resyntheses: u32,
    row_cap: usize,
}

impl AnalyticalPipeline {
    pub fn new(llm: Arc<dyn ChatModel>, gate: Arc<SqlGate>, config: &PipelineConfig) -> Self {
        Self {
            llm,
            gate,
            max_steps: config.max_plan_steps.max(1),
            max_resyntheses: config.max_synthesis_attempts,
            row_cap: config.step_row_cap,
        }
    }

    pub async fn run(
        &self,
        question: &str,
        snapshot: &SchemaSnapshot,
        schema_context: &str,
        events: &EventSink,
    ) -> Result<AnalysisOutcome, PipelineError> {
        let plan = self.plan_analysis(question, schema_context, events).await?;

        let mut steps: Vec<AnalysisStep> = Vec::with_capacity(plan.steps.len());
        for (index, planned) in plan.steps.iter().enumerate() {
            let step = self
                .execute_plan_step(index, planned, &steps, snapshot, schema_context, events)
                .await;
            steps.push(step);
        }

        let mut feedback = String::new();
        let mut best: Option<(String, Vec<String>)> = None;
        let mut attempt = 0;
        loop {
            let answer = match self
                .synthesize_analysis(question, &steps, &plan.synthesis_guidance, &feedback, events)
                .await
            {
                Ok(answer) => answer,
                // a revision failing still leaves the earlier draft
                Err(e) if best.is_some() => {
                    warn!("Re-synthesis failed, keeping the previous draft: {}", e);
                    break;
                }
                Err(e) => return Err(e),
            };

            let warnings = validate_analysis(question, &steps, &answer);
            if best.as_ref().is_none_or(|(_, w)| warnings.len() <= w.len()) {
                best = Some((answer, warnings.clone()));
            }

            if warnings.is_empty() {
                info!("Analysis validation passed");
                events.emit(PipelineEvent::AnalysisValidationPassed);
                break;
            }

            events.emit(PipelineEvent::AnalysisValidationWarning {
                warnings: warnings.clone(),
            });
            if attempt >= self.max_resyntheses {
                info!("Accepting analysis with warnings: {:?}", warnings);
                break;
            }
            attempt += 1;
            info!("Revising analysis ({}/{})", attempt, self.max_resyntheses);
            feedback = warnings.join("\n");
        }

        let (answer, warnings) = best.unwrap_or_default();
        Ok(AnalysisOutcome {
            plan: plan.steps.iter().map(|s| s.description.clone()).collect(),
            steps,
            answer,
            warnings,
        })
    }

    /// Asks for a step plan. A reply that doesn't parse into at least one
    /// step falls back to a single direct step.
    pub async fn plan_analysis(
        &self,
        question: &str,
        schema_context: &str,
        events: &EventSink,
    ) -> Result<AnalysisPlan, PipelineError> {
        events.emit(PipelineEvent::PlanningAnalysis);

        let prompt = prompts::planner_prompt(question, schema_context, self.max_steps);
        let reply = self
            .llm
            .complete("You plan multi-step SQL analyses.", &prompt)
            .await?;

        let mut plan = extract_json_object(&reply)
            .and_then(|value| serde_json::from_value::<AnalysisPlan>(value).ok())
            .filter(|plan| plan.steps.iter().any(|s| !s.description.trim().is_empty()))
            .unwrap_or_else(|| {
                warn!("Planner reply unusable, falling back to a single step");
                AnalysisPlan::single_step(question)
            });
        plan.steps.retain(|s| !s.description.trim().is_empty());
        plan.steps.truncate(self.max_steps);

        info!("Analysis plan has {} steps", plan.steps.len());
        events.emit(PipelineEvent::AnalysisPlanCreated {
            steps: plan.steps.iter().map(|s| s.description.clone()).collect(),
            step_count: plan.steps.len(),
        });
        Ok(plan)
    }

    /// Generates, validates and runs the step's SQL. Failures land on the
    /// returned step instead of propagating.
    pub async fn execute_plan_step(
        &self,
        index: usize,
        planned: &PlannedStep,
        previous: &[AnalysisStep],
        snapshot: &SchemaSnapshot,
        schema_context: &str,
        events: &EventSink,
    ) -> AnalysisStep {
        events.emit(PipelineEvent::PlanStepStarted {
            step_index: index,
            description: planned.description.clone(),
        });

        let mut step = AnalysisStep {
            index,
            description: planned.description.clone(),
            purpose: planned.purpose.clone(),
            sql: None,
            result: None,
            row_count: 0,
            error: None,
        };

        match self.run_step(index, planned, previous, snapshot, schema_context, events, &mut step).await {
            Ok(rows) => {
                debug!("Step {} returned {} rows", index, rows.len());
                events.emit(PipelineEvent::PlanStepExecuted {
                    step_index: index,
                    row_count: rows.len(),
                });
                step.row_count = rows.len();
                step.result = Some(rows.into_iter().take(self.row_cap).collect());
            }
            Err(error) => {
                warn!("Step {} failed: {}", index, error);
                events.emit(PipelineEvent::PlanStepFailed {
                    step_index: index,
                    error: error.clone(),
                });
                step.error = Some(error);
            }
        }
        step
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        index: usize,
        planned: &PlannedStep,
        previous: &[AnalysisStep],
        snapshot: &SchemaSnapshot,
        schema_context: &str,
        events: &EventSink,
        step: &mut AnalysisStep,
    ) -> Result<Vec<Row>, String> {
        let prompt = prompts::step_sql_prompt(
            self.gate.dialect(),
            &planned.description,
            &planned.sql_hint,
            schema_context,
            &previous_results_context(previous),
        );
        let reply = self
            .llm
            .complete(SQL_SYSTEM, &prompt)
            .await
            .map_err(|e| e.to_string())?;
        let sql = extract_sql(&reply).ok_or_else(|| "No SQL found in the model reply".to_string())?;

        step.sql = Some(sql.clone());
        events.emit(PipelineEvent::PlanStepSqlGenerated {
            step_index: index,
            sql: sql.clone(),
        });

        let errors = self
            .gate
            .validate(&sql, snapshot)
            .await
            .map_err(|e| e.to_string())?;
        if !errors.is_empty() {
            return Err(format!("Validation failed: {}", errors.join("; ")));
        }

        self.gate.execute(&sql).await.map_err(|e| e.to_string())
    }

    pub async fn synthesize_analysis(
        &self,
        question: &str,
        steps: &[AnalysisStep],
        guidance: &str,
        feedback: &str,
        events: &EventSink,
    ) -> Result<String, PipelineError> {
        events.emit(PipelineEvent::AnalysisSynthesisStarted);

        let prompt = prompts::analyst_prompt(question, &results_context(steps), guidance, feedback);
        let answer = self.llm.complete(ANALYST_SYSTEM, &prompt).await?.trim().to_string();

        info!("Synthesized analysis ({} chars)", answer.len());
        events.emit(PipelineEvent::AnalysisComplete {
            answer: answer.clone(),
        });
        Ok(answer)
    }
}

/// Deterministic quality checks on a synthesized answer.
pub fn validate_analysis(question: &str, steps: &[AnalysisStep], answer: &str) -> Vec<String> {
    let mut warnings = Vec::new();

    if answer.trim().is_empty() {
        warnings.push("Synthesis is empty".to_string());
        return warnings;
    }

    let total = steps.len();
    let succeeded = steps.iter().filter(|s| s.succeeded()).count();
    if total > 0 && succeeded * 2 < total {
        warnings.push(format!("Only {}/{} analysis steps succeeded", succeeded, total));
    }

    if succeeded > 0 && answer.chars().count() < succeeded * 50 {
        warnings.push("Answer seems too brief for the number of successful analysis steps".to_string());
    }

    let key_terms: HashSet<String> = question
        .split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| w.chars().count() > 3)
        .collect();
    if !key_terms.is_empty() {
        let lowered = answer.to_lowercase();
        let covered = key_terms.iter().filter(|t| lowered.contains(t.as_str())).count();
        if (covered as f64) / (key_terms.len() as f64) < 0.3 {
            warnings.push("Answer may not address key terms from the question".to_string());
        }
    }

    let empty_steps: Vec<String> = steps
        .iter()
        .filter(|s| s.succeeded() && s.row_count == 0)
        .map(|s| format!("Step {}", s.index + 1))
        .collect();
    if !empty_steps.is_empty() && empty_steps.len() == succeeded && !mentions_no_data(answer) {
        warnings.push(format!(
            "{} returned no rows but the answer does not say so",
            empty_steps.join(", ")
        ));
    }

    warnings
}

fn mentions_no_data(answer: &str) -> bool {
    let lowered = answer.to_lowercase();
    ["no data", "no rows", "no results", "none", "empty", "zero", "unavailable"]
        .iter()
        .any(|p| lowered.contains(p))
}

fn previous_results_context(previous: &[AnalysisStep]) -> String {
    if previous.is_empty() {
        return String::new();
    }
    let parts: Vec<String> = previous
        .iter()
        .map(|s| {
            let status = match &s.error {
                Some(e) => format!("Failed: {}", e),
                None => "Success".to_string(),
            };
            let preview = s
                .result
                .as_deref()
                .map(|rows| rows_json(&rows[..rows.len().min(PREVIEW_ROWS)]))
                .unwrap_or_default();
            format!(
                "Step {} ({}): {}\n  SQL: {}\n  Result preview: {}",
                s.index + 1,
                s.description,
                status,
                s.sql.as_deref().unwrap_or("N/A"),
                preview
            )
        })
        .collect();
    format!("Previous step results:\n{}", parts.join("\n"))
}

fn results_context(steps: &[AnalysisStep]) -> String {
    steps
        .iter()
        .map(|s| {
            let (status, data) = match (&s.error, &s.result) {
                (Some(e), _) => ("FAILED", format!("Error: {}", e)),
                (None, Some(rows)) => ("SUCCESS", rows_json(rows)),
                (None, None) => ("FAILED", String::new()),
            };
            format!(
                "### Step {}: {}\nStatus: {}\nSQL: {}\nRows: {}\nData:\n{}",
                s.index + 1,
                s.description,
                status,
                s.sql.as_deref().unwrap_or("N/A"),
                s.row_count,
                data
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn rows_json(rows: &[Row]) -> String {
    serde_json::to_string(rows).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::duckdb_backend::tests::music_backend;
    use crate::db::DatabaseBackend;
    use crate::pipeline::testing::{RecordingBackend, ScriptedChat};
    use std::time::Duration;

    const PLAN: &str = r#"{"steps": [
        {"description": "Count albums per artist", "sql_hint": "GROUP BY ArtistId", "purpose": "volume"},
        {"description": "Track revenue per album", "sql_hint": "SUM(UnitPrice)", "purpose": "revenue"},
        {"description": "Count tracks per album", "sql_hint": "GROUP BY AlbumId", "purpose": "depth"}
    ], "synthesis_guidance": "Rank artists."}"#;

    const GOOD_ANSWER: &str = "Artists differ a lot: the album count per artist ranges from one to \
        three, and the track count per album is steady. Revenue data for artists is unavailable \
        because that step failed.";

    async fn pipeline(chat: Arc<ScriptedChat>, backend: Arc<dyn DatabaseBackend>) -> (AnalyticalPipeline, SchemaSnapshot) {
        let snapshot = SchemaSnapshot::new(backend.discover_tables().await.unwrap());
        let gate = Arc::new(SqlGate::new(backend, Duration::from_secs(5)));
        (AnalyticalPipeline::new(chat, gate, &PipelineConfig::default()), snapshot)
    }

    fn sql_reply(sql: &str) -> crate::llm::models::ChatResponse {
        ScriptedChat::text(&format!("```sql\n{}\n```", sql))
    }

    #[tokio::test]
    async fn failing_step_does_not_abort_the_plan() {
        let backend = Arc::new(
            RecordingBackend::wrapping(Arc::new(music_backend()))
                .failing_when("UnitPrice", "IO Error: disk unavailable"),
        );
        let chat = ScriptedChat::new(vec![
            ScriptedChat::text(PLAN),
            sql_reply("SELECT ArtistId, COUNT(*) AS albums FROM Album GROUP BY ArtistId"),
            sql_reply("SELECT AlbumId, SUM(UnitPrice) AS revenue FROM Track GROUP BY AlbumId"),
            sql_reply("SELECT AlbumId, COUNT(*) AS tracks FROM Track GROUP BY AlbumId"),
            ScriptedChat::text(GOOD_ANSWER),
        ]);
        let (analytical, snapshot) = pipeline(chat.clone(), backend).await;
        let (events, mut rx) = EventSink::channel();

        let outcome = analytical
            .run("Compare artists by album count and track count", &snapshot, "schema", &events)
            .await
            .unwrap();

        assert_eq!(outcome.steps.len(), 3);
        assert!(outcome.steps[0].succeeded());
        assert!(outcome.steps[1].error.as_deref().unwrap().contains("disk unavailable"));
        assert!(outcome.steps[2].succeeded());
        assert_eq!(outcome.answer, GOOD_ANSWER);
        assert!(outcome.warnings.is_empty());
        assert_eq!(chat.remaining(), 0);

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.event_type());
        }
        assert_eq!(names.iter().filter(|n| **n == "plan_step_failed").count(), 1);
        assert_eq!(names.iter().filter(|n| **n == "plan_step_executed").count(), 2);
        assert_eq!(names.last(), Some(&"analysis_validation_passed"));
    }

    #[tokio::test]
    async fn step_results_are_capped_but_counted() {
        let chat = ScriptedChat::new(vec![
            ScriptedChat::text(r#"{"steps": [{"description": "List tracks"}]}"#),
            sql_reply("SELECT Name FROM Track"),
            ScriptedChat::text("There are 42 tracks listed, and the track names are all distinct across the catalogue."),
        ]);
        let (analytical, snapshot) = pipeline(chat, Arc::new(music_backend())).await;

        let outcome = analytical
            .run("List every track name", &snapshot, "schema", &EventSink::disabled())
            .await
            .unwrap();
        let step = &outcome.steps[0];
        assert_eq!(step.row_count, 42);
        assert_eq!(step.result.as_ref().unwrap().len(), 20);
    }

    #[tokio::test]
    async fn weak_synthesis_is_revised_once() {
        let chat = ScriptedChat::new(vec![
            ScriptedChat::text(r#"{"steps": [{"description": "Count albums"}]}"#),
            sql_reply("SELECT COUNT(*) AS albums FROM Album"),
            ScriptedChat::text("Fine."),
            ScriptedChat::text("The catalogue holds 20 albums in total, spread across the artists in the database."),
        ]);
        let (analytical, snapshot) = pipeline(chat.clone(), Arc::new(music_backend())).await;
        let (events, mut rx) = EventSink::channel();

        let outcome = analytical
            .run("How many albums does the catalogue hold?", &snapshot, "schema", &events)
            .await
            .unwrap();
        assert!(outcome.answer.starts_with("The catalogue holds 20 albums"));
        assert!(outcome.warnings.is_empty());

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.event_type());
        }
        assert_eq!(names.iter().filter(|n| **n == "analysis_synthesis_started").count(), 2);
        assert!(names.contains(&"analysis_validation_warning"));
        // revision prompt carries the problems found
        let last = chat.requests().pop().unwrap();
        assert!(last[1].content.contains("too brief"));
    }

    #[tokio::test]
    async fn unusable_plan_falls_back_to_one_step() {
        let chat = ScriptedChat::new(vec![
            ScriptedChat::text("Let me think about that."),
            sql_reply("SELECT COUNT(*) AS artists FROM Artist"),
            ScriptedChat::text("There are 15 artists in the catalogue, each with at least one album recorded."),
        ]);
        let (analytical, snapshot) = pipeline(chat, Arc::new(music_backend())).await;

        let outcome = analytical
            .run("How many artists are there?", &snapshot, "schema", &EventSink::disabled())
            .await
            .unwrap();
        assert_eq!(outcome.plan, vec!["How many artists are there?"]);
        assert_eq!(outcome.steps.len(), 1);
    }

    #[test]
    fn flags_mostly_failed_plans() {
        let failed = AnalysisStep {
            index: 0,
            description: "a".into(),
            purpose: String::new(),
            sql: None,
            result: None,
            row_count: 0,
            error: Some("boom".into()),
        };
        let steps = vec![failed.clone(), AnalysisStep { index: 1, ..failed }];
        let warnings = validate_analysis("why", &steps, "Nothing could be computed.");
        assert_eq!(warnings, vec!["Only 0/2 analysis steps succeeded"]);
        assert_eq!(validate_analysis("why", &steps, "  "), vec!["Synthesis is empty"]);
    }
}
