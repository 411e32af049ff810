use crate::llm::extract::extract_json_object;
use crate::llm::{prompts, ChatModel};
use crate::pipeline::events::{EventSink, PipelineEvent};
use crate::pipeline::record::QueryType;
use crate::schema::SchemaSnapshot;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct Classification {
    query_type: QueryType,
    #[serde(default)]
    reasoning: String,
}

/// Routes a question to the simple or the analytical path.
pub struct QueryClassifier {
    llm: Arc<dyn ChatModel>,
}

impl QueryClassifier {
    pub fn new(llm: Arc<dyn ChatModel>) -> Self {
        Self { llm }
    }

    /// Never fails: provider errors and unusable replies classify as simple.
    pub async fn classify(
        &self,
        question: &str,
        snapshot: &SchemaSnapshot,
        events: &EventSink,
    ) -> QueryType {
        events.emit(PipelineEvent::ClassifyingQuery);

        let query_type = if question.trim().is_empty() {
            QueryType::Simple
        } else {
            self.ask(question, snapshot).await
        };

        events.emit(PipelineEvent::QueryClassified { query_type });
        query_type
    }

    async fn ask(&self, question: &str, snapshot: &SchemaSnapshot) -> QueryType {
        let tables = snapshot
            .tables
            .iter()
            .map(|t| t.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let prompt = prompts::classifier_prompt(question, &tables);

        let reply = match self
            .llm
            .complete("You classify questions about a database.", &prompt)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Classification call failed, defaulting to simple: {}", e);
                return QueryType::Simple;
            }
        };

        let parsed = extract_json_object(&reply)
            .and_then(|value| serde_json::from_value::<Classification>(value).ok());
        match parsed {
            Some(c) => {
                info!("Classified as {:?}: {}", c.query_type, c.reasoning);
                c.query_type
            }
            None => {
                warn!("Unusable classification reply, defaulting to simple");
                QueryType::Simple
            }
        }
    }
}
