use crate::db::Row;
use crate::pipeline::record::QueryType;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub sql: String,
    pub result: Vec<Row>,
    pub answer: String,
    pub query_type: QueryType,
    pub stored_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
}

/// Lowercase, trim and collapse internal whitespace.
pub fn normalize_question(question: &str) -> String {
    question
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Exact-match cache of answered questions, keyed by normalized text and schema hash.
pub struct QueryCache {
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl QueryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn key(question: &str, schema_hash: &str) -> String {
        let digest = Sha256::digest(format!("{}|{}", normalize_question(question), schema_hash));
        format!("{:x}", digest)
    }

    /// Expired entries are dropped here rather than by a sweeper.
    pub async fn get(&self, question: &str, schema_hash: &str) -> Option<CacheEntry> {
        let key = Self::key(question, schema_hash);
        let mut inner = self.inner.lock().await;

        let expired = match inner.entries.get(&key) {
            None => {
                inner.misses += 1;
                return None;
            }
            Some(entry) => {
                let age = Utc::now() - entry.stored_at;
                age.to_std().map_or(false, |age| age > self.ttl)
            }
        };

        if expired {
            debug!("Query cache entry expired");
            inner.entries.remove(&key);
            inner.misses += 1;
            return None;
        }

        inner.hits += 1;
        inner.entries.get(&key).cloned()
    }

    pub async fn put(
        &self,
        question: &str,
        schema_hash: &str,
        sql: &str,
        result: Vec<Row>,
        answer: &str,
        query_type: QueryType,
    ) {
        let key = Self::key(question, schema_hash);
        let entry = CacheEntry {
            sql: sql.to_string(),
            result,
            answer: answer.to_string(),
            query_type,
            stored_at: Utc::now(),
        };
        self.inner.lock().await.entries.insert(key, entry);
    }

    /// Drops every entry; hit/miss counters are kept.
    pub async fn flush(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let removed = inner.entries.len();
        inner.entries.clear();
        removed
    }

    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().await;
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            size: inner.entries.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows() -> Vec<Row> {
        match json!({"count": 42}) {
            serde_json::Value::Object(map) => vec![map],
            _ => unreachable!(),
        }
    }

    #[test]
    fn normalization_folds_case_and_whitespace() {
        assert_eq!(
            normalize_question("  How many   TRACKS\tare there? "),
            "how many tracks are there?"
        );
    }

    #[tokio::test]
    async fn hit_requires_same_normalized_text_and_schema() {
        let cache = QueryCache::new(Duration::from_secs(60));
        cache
            .put("How many tracks?", "abc", "SELECT COUNT(*) FROM Track", rows(), "42", QueryType::Simple)
            .await;

        let hit = cache.get("how many   tracks?", "abc").await.unwrap();
        assert_eq!(hit.answer, "42");
        assert!(cache.get("how many tracks?", "other-schema").await.is_none());
        assert!(cache.get("how many songs?", "abc").await.is_none());

        let stats = cache.stats().await;
        assert_eq!(stats, CacheStats { hits: 1, misses: 2, size: 1 });
    }

    #[tokio::test]
    async fn expired_entries_are_removed_on_read() {
        let cache = QueryCache::new(Duration::from_millis(10));
        cache.put("q", "h", "SELECT 1", rows(), "1", QueryType::Simple).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(cache.get("q", "h").await.is_none());
        assert_eq!(cache.stats().await.size, 0);
    }

    #[tokio::test]
    async fn flush_empties_the_cache() {
        let cache = QueryCache::new(Duration::from_secs(60));
        cache.put("a", "h", "SELECT 1", rows(), "1", QueryType::Simple).await;
        cache.put("b", "h", "SELECT 2", rows(), "2", QueryType::Simple).await;
        assert_eq!(cache.flush().await, 2);
        assert!(cache.get("a", "h").await.is_none());
    }
}
