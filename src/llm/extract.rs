use serde_json::Value;
use tracing::debug;

/// Pulls a SQL statement out of a free-form model reply.
///
/// Tries a ```sql fence, then a bare ``` fence, then scans for the first line
/// starting with SELECT or WITH and collects until a closing fence or `;`.
/// Returns `None` when nothing SQL-like is found.
pub fn extract_sql(content: &str) -> Option<String> {
    if let Some(start) = content.find("```sql") {
        let after = &content[start + 6..];
        let end = after.find("```").unwrap_or(after.len());
        let sql = after[..end].trim();
        if !sql.is_empty() {
            debug!("Extracted SQL from sql code block");
            return Some(sql.to_string());
        }
    }

    if let Some(start) = content.find("```") {
        let after = &content[start + 3..];
        if let Some(end) = after.find("```") {
            let sql = after[..end].trim();
            if !sql.is_empty() {
                debug!("Extracted SQL from bare code block");
                return Some(sql.to_string());
            }
        }
    }

    let lines: Vec<&str> = content.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        let upper = line.trim().to_uppercase();
        if !(upper.starts_with("SELECT") || upper.starts_with("WITH")) {
            continue;
        }

        let mut sql = line.trim().to_string();
        if !sql.ends_with(';') {
            for next in &lines[i + 1..] {
                let next = next.trim();
                if next.starts_with("```") {
                    break;
                }
                sql.push(' ');
                sql.push_str(next);
                if next.ends_with(';') {
                    break;
                }
            }
        }
        debug!("Extracted SQL using line scanning");
        return Some(sql.trim().to_string());
    }

    None
}

/// First `{ ... }` span in `content` that parses as a JSON object.
pub fn extract_json_object(content: &str) -> Option<Value> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str::<Value>(&content[start..=end])
        .ok()
        .filter(Value::is_object)
}

/// First `[ ... ]` span in `content` that parses as a JSON array.
pub fn extract_json_array(content: &str) -> Option<Vec<Value>> {
    let start = content.find('[')?;
    let end = content.rfind(']')?;
    if end < start {
        return None;
    }
    match serde_json::from_str::<Value>(&content[start..=end]).ok()? {
        Value::Array(items) => Some(items),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_sql_fence() {
        let reply = "Here you go:\n```sql\nSELECT COUNT(*) FROM Track;\n```\nDone.";
        assert_eq!(extract_sql(reply).as_deref(), Some("SELECT COUNT(*) FROM Track;"));
    }

    #[test]
    fn falls_back_to_bare_fence_and_line_scan() {
        assert_eq!(
            extract_sql("```\nSELECT 1\n```").as_deref(),
            Some("SELECT 1")
        );
        let reply = "The query is\nSELECT Name\nFROM Artist\nLIMIT 5;\nThat should work.";
        assert_eq!(
            extract_sql(reply).as_deref(),
            Some("SELECT Name FROM Artist LIMIT 5;")
        );
        assert_eq!(extract_sql("I cannot answer that."), None);
    }

    #[test]
    fn finds_embedded_json() {
        let obj = extract_json_object("Sure! {\"query_type\": \"simple\"} hope that helps").unwrap();
        assert_eq!(obj["query_type"], "simple");

        let arr = extract_json_array("Relevant: [\"Track\", \"Album\"]").unwrap();
        assert_eq!(arr.len(), 2);
        assert!(extract_json_object("no json here").is_none());
    }
}
