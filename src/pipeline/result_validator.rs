use crate::config::AnomalyConfig;
use crate::db::Row;
use regex::Regex;
use std::sync::LazyLock;

static TOP_N: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\btop\s+(\d+)").unwrap());
static LIMIT_N: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bLIMIT\s+(\d+)").unwrap());

/// Heuristic checks on executed results that hint the SQL missed the question.
#[derive(Debug, Clone)]
pub struct ResultValidator {
    config: AnomalyConfig,
}

impl ResultValidator {
    pub fn new(config: AnomalyConfig) -> Self {
        Self { config }
    }

    /// Warnings for the result, empty when nothing looks off.
    pub fn check(&self, question: &str, sql: &str, rows: &[Row]) -> Vec<String> {
        let mut warnings = Vec::new();
        if let Some(w) = self.empty_aggregate(sql, rows) {
            warnings.push(w);
        }
        if let Some(w) = self.negative_values(rows) {
            warnings.push(w);
        }
        if let Some(w) = self.limit_mismatch(question, sql, rows) {
            warnings.push(w);
        }
        warnings
    }

    fn empty_aggregate(&self, sql: &str, rows: &[Row]) -> Option<String> {
        if !self.config.flag_empty_aggregates || !rows.is_empty() {
            return None;
        }
        let upper = sql.to_uppercase();
        self.config
            .aggregate_functions
            .iter()
            .any(|f| upper.contains(&f.to_uppercase()))
            .then(|| {
                "Aggregate query returned no rows; the table may be empty or the filter too restrictive"
                    .to_string()
            })
    }

    fn negative_values(&self, rows: &[Row]) -> Option<String> {
        let first = rows.first()?;
        for column in first.keys() {
            let lowered = column.to_lowercase();
            if !self.config.non_negative_columns.iter().any(|c| c == &lowered) {
                continue;
            }
            let negative = rows
                .iter()
                .filter_map(|row| row.get(column).and_then(|v| v.as_f64()))
                .any(|v| v < 0.0);
            if negative {
                return Some(format!("Unexpected negative value in column '{}'", column));
            }
        }
        None
    }

    fn limit_mismatch(&self, question: &str, sql: &str, rows: &[Row]) -> Option<String> {
        if !self.config.flag_limit_mismatch {
            return None;
        }
        let requested: usize = TOP_N.captures(question)?.get(1)?.as_str().parse().ok()?;
        let limit: usize = LIMIT_N.captures(sql)?.get(1)?.as_str().parse().ok()?;
        (limit != requested && rows.len() > requested).then(|| {
            format!(
                "Question asks for the top {} but the query returned {} rows",
                requested,
                rows.len()
            )
        })
    }
}
