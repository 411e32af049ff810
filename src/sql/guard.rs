//! Static read-only checks applied to every statement before it reaches a
//! database connection.

use regex::Regex;
use sqlparser::ast::{Query, Statement, TableFactor, Visit, Visitor};
use sqlparser::dialect::DuckDbDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::LazyLock;
use tracing::debug;

static IDENTIFIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,127}$").expect("valid identifier regex"));

const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "TRUNCATE", "CREATE", "GRANT", "REVOKE",
    "MERGE", "ATTACH", "DETACH", "COPY", "PRAGMA", "VACUUM", "INSTALL", "EXPORT", "IMPORT",
    "CALL",
];

const DIALECT: DuckDbDialect = DuckDbDialect {};

/// Read-only SQL guard. Stateless; `check` returns an empty list for safe SQL.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOnlyGuard;

impl ReadOnlyGuard {
    pub fn new() -> Self {
        Self
    }

    pub fn check(&self, sql: &str) -> Vec<String> {
        let tokens = match Tokenizer::new(&DIALECT, sql).tokenize() {
            Ok(tokens) => tokens,
            Err(e) => return vec![format!("Could not read SQL: {}", e)],
        };
        let segments = split_statements(&tokens);
        if segments.is_empty() {
            return vec!["Empty SQL statement".to_string()];
        }

        // Statement shape comes from the parser. DuckDB accepts syntax the
        // parser doesn't know, so a parse failure falls back to the tokens.
        let (count, offending) = match Parser::parse_sql(&DIALECT, sql) {
            Ok(statements) => (
                statements.len(),
                statements
                    .iter()
                    .position(|s| !matches!(s, Statement::Query(_)))
                    .map(|i| segments.get(i).and_then(|segment| leading_keyword(segment))),
            ),
            Err(e) => {
                debug!("Guard falling back to token scan: {}", e);
                let offending = segments
                    .iter()
                    .map(|segment| leading_keyword(segment))
                    .find(|kw| !matches!(kw.as_deref(), Some("SELECT" | "WITH")));
                (segments.len(), offending)
            }
        };

        let mut violations = Vec::new();
        if count > 1 {
            violations.push(format!("Multiple statements are not allowed (found {})", count));
        }

        let mut seen = HashSet::new();
        for word in unquoted_words(&tokens) {
            if FORBIDDEN_KEYWORDS.contains(&word.as_str()) && seen.insert(word.clone()) {
                violations.push(format!(
                    "Forbidden SQL operation: {}. Only SELECT/WITH queries are allowed.",
                    word
                ));
            }
        }

        match offending {
            Some(Some(word)) => violations.push(format!(
                "Statement must start with SELECT or WITH (found {})",
                word
            )),
            Some(None) => violations.push("Statement must start with SELECT or WITH".to_string()),
            None => {}
        }

        violations
    }

    /// Accepts only plain `[A-Za-z_][A-Za-z0-9_]*` names.
    pub fn validate_identifier(&self, name: &str) -> bool {
        IDENTIFIER_RE.is_match(name)
    }

    /// Tables read by the statement, excluding CTE names, subqueries and
    /// table functions. Schema-qualified names are reduced to the table part.
    /// SQL the parser can't read yields nothing; the dry run reports it.
    pub fn referenced_tables(&self, sql: &str) -> Vec<String> {
        let statements = match Parser::parse_sql(&DIALECT, sql) {
            Ok(statements) => statements,
            Err(e) => {
                debug!("Could not parse SQL for table references: {}", e);
                return Vec::new();
            }
        };

        let mut collector = RelationCollector::default();
        for statement in &statements {
            let _ = statement.visit(&mut collector);
        }
        let RelationCollector { ctes, tables } = collector;
        tables
            .into_iter()
            .filter(|name| !ctes.contains(&name.to_ascii_lowercase()))
            .collect()
    }
}

#[derive(Default)]
struct RelationCollector {
    ctes: HashSet<String>,
    tables: Vec<String>,
}

impl Visitor for RelationCollector {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<()> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.ctes.insert(cte.alias.name.value.to_ascii_lowercase());
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, factor: &TableFactor) -> ControlFlow<()> {
        if let TableFactor::Table { name, args: None, .. } = factor {
            if let Some(ident) = name.0.last() {
                if !self.tables.iter().any(|t| t.eq_ignore_ascii_case(&ident.value)) {
                    self.tables.push(ident.value.clone());
                }
            }
        }
        ControlFlow::Continue(())
    }
}

/// Significant tokens grouped by top-level `;`, empty statements dropped.
fn split_statements(tokens: &[Token]) -> Vec<Vec<&Token>> {
    let mut statements = Vec::new();
    let mut current = Vec::new();
    for token in tokens {
        match token {
            Token::Whitespace(_) | Token::EOF => {}
            Token::SemiColon => {
                if !current.is_empty() {
                    statements.push(std::mem::take(&mut current));
                }
            }
            other => current.push(other),
        }
    }
    if !current.is_empty() {
        statements.push(current);
    }
    statements
}

/// Uppercased bare words; quoted identifiers and literals never count.
fn unquoted_words(tokens: &[Token]) -> impl Iterator<Item = String> + '_ {
    tokens.iter().filter_map(|token| match token {
        Token::Word(word) if word.quote_style.is_none() => Some(word.value.to_ascii_uppercase()),
        _ => None,
    })
}

fn leading_keyword(segment: &[&Token]) -> Option<String> {
    segment
        .iter()
        .find(|t| !matches!(t, Token::LParen))
        .and_then(|t| match t {
            Token::Word(word) if word.quote_style.is_none() => Some(word.value.to_ascii_uppercase()),
            _ => None,
        })
}
