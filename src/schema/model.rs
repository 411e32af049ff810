use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    #[serde(default)]
    pub description: String,
}

impl ColumnInfo {
    pub fn new(name: &str, data_type: &str, nullable: bool) -> Self {
        Self {
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable,
            description: String::new(),
        }
    }

    pub fn to_sql_definition(&self) -> String {
        let nullable_str = if self.nullable { "" } else { " NOT NULL" };
        let comment = if self.description.is_empty() {
            String::new()
        } else {
            format!("  -- {}", self.description)
        };
        format!("{} {}{}{}", self.name, self.data_type, nullable_str, comment)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableInfo {
    pub name: String,
    #[serde(default)]
    pub schema_name: String,
    #[serde(default = "default_table_type")]
    pub table_type: String,
    #[serde(default)]
    pub description: String,
    pub columns: Vec<ColumnInfo>,
}

fn default_table_type() -> String {
    "TABLE".to_string()
}

impl TableInfo {
    pub fn new(name: &str, columns: Vec<ColumnInfo>) -> Self {
        Self {
            name: name.to_string(),
            schema_name: String::new(),
            table_type: default_table_type(),
            description: String::new(),
            columns,
        }
    }

    pub fn qualified_name(&self) -> String {
        if self.schema_name.is_empty() || self.schema_name == "main" {
            self.name.clone()
        } else {
            format!("{}.{}", self.schema_name, self.name)
        }
    }

    /// CREATE TABLE DDL with description comments, used as LLM context.
    pub fn to_ddl(&self) -> String {
        let columns_sql: Vec<String> = self
            .columns
            .iter()
            .map(|col| col.to_sql_definition())
            .collect();

        let header = if self.description.is_empty() {
            String::new()
        } else {
            format!("-- {}\n", self.description)
        };

        format!(
            "{}CREATE TABLE {} (\n    {}\n);",
            header,
            self.qualified_name(),
            columns_sql.join(",\n    ")
        )
    }
}

/// Externally supplied descriptions, keyed by table name.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TableDescription {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub columns: HashMap<String, String>,
}

/// Immutable view of the database structure. Replaced wholesale on refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub tables: Vec<TableInfo>,
    pub fetched_at: DateTime<Utc>,
}

impl SchemaSnapshot {
    pub fn new(tables: Vec<TableInfo>) -> Self {
        Self {
            tables,
            fetched_at: Utc::now(),
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableInfo> {
        self.tables
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.table(name).is_some()
    }

    /// SHA-256 over sorted `table:columns`, first 16 hex chars.
    pub fn schema_hash(&self) -> String {
        let mut tables: Vec<&TableInfo> = self.tables.iter().collect();
        tables.sort_by(|a, b| a.name.cmp(&b.name));

        let parts: Vec<String> = tables
            .iter()
            .map(|t| {
                let mut cols: Vec<&str> = t.columns.iter().map(|c| c.name.as_str()).collect();
                cols.sort_unstable();
                format!("{}:{}", t.name, cols.join(","))
            })
            .collect();

        let digest = Sha256::digest(parts.join("|").as_bytes());
        format!("{:x}", digest)[..16].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track() -> TableInfo {
        TableInfo::new(
            "Track",
            vec![
                ColumnInfo::new("TrackId", "INTEGER", false),
                ColumnInfo::new("Name", "VARCHAR", true),
            ],
        )
    }

    #[test]
    fn ddl_includes_descriptions() {
        let mut table = track();
        table.description = "Songs available for sale".to_string();
        table.columns[1].description = "Song title".to_string();

        let ddl = table.to_ddl();
        assert!(ddl.starts_with("-- Songs available for sale\nCREATE TABLE Track ("));
        assert!(ddl.contains("TrackId INTEGER NOT NULL,"));
        assert!(ddl.contains("Name VARCHAR  -- Song title"));
    }

    #[test]
    fn schema_hash_ignores_ordering() {
        let a = SchemaSnapshot::new(vec![track(), TableInfo::new("Album", vec![])]);
        let mut reordered = track();
        reordered.columns.reverse();
        let b = SchemaSnapshot::new(vec![TableInfo::new("Album", vec![]), reordered]);
        assert_eq!(a.schema_hash(), b.schema_hash());
        assert_eq!(a.schema_hash().len(), 16);

        let c = SchemaSnapshot::new(vec![track()]);
        assert_ne!(a.schema_hash(), c.schema_hash());
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let snapshot = SchemaSnapshot::new(vec![track()]);
        assert!(snapshot.has_table("track"));
        assert!(!snapshot.has_table("nonexistent_table"));
    }
}
