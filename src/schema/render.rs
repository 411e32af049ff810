use crate::config::SchemaConfig;
use crate::schema::model::TableInfo;

/// Rough token count: one token per four characters, never zero.
pub fn estimate_tokens(text: &str) -> usize {
    (text.chars().count() / 4).max(1)
}

/// Split of the context token budget between schema DDL and conversation history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextBudget {
    pub schema_tokens: usize,
    pub history_tokens: usize,
}

impl ContextBudget {
    pub fn from_config(config: &SchemaConfig) -> Self {
        let total = config.context_token_budget;
        let share = config.history_share.clamp(0.0, 1.0);
        let history_tokens = (total as f32 * share) as usize;
        Self {
            schema_tokens: total - history_tokens,
            history_tokens,
        }
    }
}

pub fn render_all(tables: &[TableInfo]) -> String {
    tables
        .iter()
        .map(TableInfo::to_ddl)
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Renders DDL until `max_tokens` is used up. Described tables go first,
/// then alphabetical; whatever does not fit is listed by name.
pub fn render_budgeted(tables: &[TableInfo], max_tokens: usize) -> String {
    let mut ordered: Vec<&TableInfo> = tables.iter().collect();
    ordered.sort_by(|a, b| {
        a.description
            .is_empty()
            .cmp(&b.description.is_empty())
            .then_with(|| a.name.cmp(&b.name))
    });

    let mut included = Vec::new();
    let mut omitted = Vec::new();
    let mut used = 0;

    for table in ordered {
        let ddl = table.to_ddl();
        let cost = estimate_tokens(&ddl);
        if used + cost <= max_tokens {
            used += cost;
            included.push(ddl);
        } else {
            omitted.push(table.qualified_name());
        }
    }

    let mut rendered = included.join("\n\n");
    if !omitted.is_empty() {
        if !rendered.is_empty() {
            rendered.push_str("\n\n");
        }
        rendered.push_str(&format!("-- Tables omitted: {}", omitted.join(", ")));
    }
    rendered
}

/// Keeps the most recent entries that fit in `max_tokens`, oldest first.
pub fn fit_history(entries: &[String], max_tokens: usize) -> Vec<String> {
    let mut kept = Vec::new();
    let mut used = 0;
    for entry in entries.iter().rev() {
        let cost = estimate_tokens(entry);
        if used + cost > max_tokens {
            break;
        }
        used += cost;
        kept.push(entry.clone());
    }
    kept.reverse();
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::model::ColumnInfo;

    fn table(name: &str, description: &str) -> TableInfo {
        let mut t = TableInfo::new(
            name,
            vec![
                ColumnInfo::new("id", "INTEGER", false),
                ColumnInfo::new("label", "VARCHAR", true),
            ],
        );
        t.description = description.to_string();
        t
    }

    #[test]
    fn token_estimate_has_a_floor() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
    }

    #[test]
    fn budget_prefers_described_tables_and_lists_the_rest() {
        let tables = vec![table("alpha", ""), table("zeta", "Important facts"), table("beta", "")];
        let one_table = estimate_tokens(&tables[1].to_ddl());

        let rendered = render_budgeted(&tables, one_table);
        assert!(rendered.starts_with("-- Important facts\nCREATE TABLE zeta"));
        assert!(rendered.ends_with("-- Tables omitted: alpha, beta"));

        let everything = render_budgeted(&tables, 10_000);
        assert!(!everything.contains("omitted"));
        assert!(everything.find("alpha").unwrap() < everything.find("beta").unwrap());
    }

    #[test]
    fn history_keeps_newest_entries() {
        let entries: Vec<String> = (0..5).map(|i| format!("turn {} {}", i, "x".repeat(36))).collect();
        let kept = fit_history(&entries, 25);
        assert_eq!(kept.len(), 2);
        assert!(kept[0].starts_with("turn 3"));
        assert!(kept[1].starts_with("turn 4"));
    }

    #[test]
    fn budget_split_follows_history_share() {
        let config = SchemaConfig {
            context_token_budget: 8000,
            history_share: 0.25,
            ..SchemaConfig::default()
        };
        let budget = ContextBudget::from_config(&config);
        assert_eq!(budget.history_tokens, 2000);
        assert_eq!(budget.schema_tokens, 6000);
    }
}
