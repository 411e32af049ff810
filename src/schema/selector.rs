use crate::config::SelectionMode;
use crate::llm::extract::extract_json_array;
use crate::llm::{prompts, ChatModel};
use crate::schema::model::TableInfo;
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;
use tracing::{info, warn};

static CAMEL_BOUNDARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([a-z0-9])([A-Z])").unwrap());
static NON_ALNUM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^A-Za-z0-9]+").unwrap());

/// Lowercase word set, splitting camelCase and underscores.
fn tokenize(text: &str) -> HashSet<String> {
    let spaced = CAMEL_BOUNDARY.replace_all(text, "$1 $2");
    NON_ALNUM
        .split(&spaced)
        .filter(|p| !p.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Narrows the table set handed to the LLM for one question.
pub struct TableSelector {
    mode: SelectionMode,
    max_tables: usize,
}

impl TableSelector {
    pub fn new(mode: SelectionMode, max_tables: usize) -> Self {
        Self {
            mode,
            max_tables: max_tables.max(1),
        }
    }

    pub async fn select(
        &self,
        question: &str,
        tables: &[TableInfo],
        llm: &dyn ChatModel,
    ) -> Vec<TableInfo> {
        match self.mode {
            SelectionMode::None => tables.to_vec(),
            SelectionMode::Keyword => self.select_by_keywords(question, tables),
            SelectionMode::Llm => self.select_by_llm(question, tables, llm).await,
        }
    }

    /// Highest keyword overlap first; every table (capped) when nothing matches.
    pub fn select_by_keywords(&self, question: &str, tables: &[TableInfo]) -> Vec<TableInfo> {
        let question_tokens = tokenize(question);
        if question_tokens.is_empty() {
            return tables.iter().take(self.max_tables).cloned().collect();
        }

        let mut scored: Vec<(usize, &TableInfo)> = tables
            .iter()
            .filter_map(|table| {
                let mut tokens = tokenize(&table.name);
                tokens.extend(tokenize(&table.description));
                for column in &table.columns {
                    tokens.extend(tokenize(&column.name));
                    tokens.extend(tokenize(&column.description));
                }
                let overlap = question_tokens.intersection(&tokens).count();
                (overlap > 0).then_some((overlap, table))
            })
            .collect();

        if scored.is_empty() {
            return tables.iter().take(self.max_tables).cloned().collect();
        }

        // stable sort keeps discovery order among equal scores
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored
            .into_iter()
            .take(self.max_tables)
            .map(|(_, t)| t.clone())
            .collect()
    }

    async fn select_by_llm(
        &self,
        question: &str,
        tables: &[TableInfo],
        llm: &dyn ChatModel,
    ) -> Vec<TableInfo> {
        let summaries: Vec<String> = tables
            .iter()
            .map(|t| {
                let cols: Vec<&str> = t.columns.iter().map(|c| c.name.as_str()).collect();
                let desc = if t.description.is_empty() {
                    String::new()
                } else {
                    format!(" -- {}", t.description)
                };
                format!("- {}{}: [{}]", t.name, desc, cols.join(", "))
            })
            .collect();

        let prompt = prompts::table_selection_prompt(question, &summaries.join("\n"), self.max_tables);
        let reply = llm
            .complete(
                "You pick the database tables relevant to a question. Reply with a JSON array of table names only.",
                &prompt,
            )
            .await;

        match reply {
            Ok(text) => {
                let names: HashSet<String> = extract_json_array(&text)
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect();
                let selected: Vec<TableInfo> = tables
                    .iter()
                    .filter(|t| names.contains(&t.name))
                    .take(self.max_tables)
                    .cloned()
                    .collect();
                if !selected.is_empty() {
                    info!("LLM selected {} of {} tables", selected.len(), tables.len());
                    return selected;
                }
                warn!("LLM table selection returned no known tables, using keyword scoring");
            }
            Err(e) => warn!("LLM table selection failed, using keyword scoring: {}", e),
        }

        self.select_by_keywords(question, tables)
    }
}
