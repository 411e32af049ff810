use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Process-wide pipeline counters exposed through the health endpoint.
pub struct PipelineMetrics {
    started: Instant,
    queries_total: AtomicU64,
    queries_executed: AtomicU64,
    queries_failed: AtomicU64,
    queries_pending: AtomicU64,
    queries_rejected: AtomicU64,
    llm_retries: AtomicU64,
    self_corrections: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub queries_total: u64,
    pub queries_executed: u64,
    pub queries_failed: u64,
    pub queries_pending: u64,
    pub queries_rejected: u64,
    pub llm_retries: u64,
    pub self_corrections: u64,
}

#[derive(Debug, Clone, Copy)]
pub enum Counter {
    QueriesTotal,
    QueriesExecuted,
    QueriesFailed,
    QueriesPending,
    QueriesRejected,
    LlmRetries,
    SelfCorrections,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            queries_total: AtomicU64::new(0),
            queries_executed: AtomicU64::new(0),
            queries_failed: AtomicU64::new(0),
            queries_pending: AtomicU64::new(0),
            queries_rejected: AtomicU64::new(0),
            llm_retries: AtomicU64::new(0),
            self_corrections: AtomicU64::new(0),
        }
    }

    fn counter(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::QueriesTotal => &self.queries_total,
            Counter::QueriesExecuted => &self.queries_executed,
            Counter::QueriesFailed => &self.queries_failed,
            Counter::QueriesPending => &self.queries_pending,
            Counter::QueriesRejected => &self.queries_rejected,
            Counter::LlmRetries => &self.llm_retries,
            Counter::SelfCorrections => &self.self_corrections,
        }
    }

    pub fn increment(&self, counter: Counter) {
        self.counter(counter).fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counter(counter).load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_seconds: self.started.elapsed().as_secs(),
            queries_total: self.get(Counter::QueriesTotal),
            queries_executed: self.get(Counter::QueriesExecuted),
            queries_failed: self.get(Counter::QueriesFailed),
            queries_pending: self.get(Counter::QueriesPending),
            queries_rejected: self.get(Counter::QueriesRejected),
            llm_retries: self.get(Counter::LlmRetries),
            self_corrections: self.get(Counter::SelfCorrections),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
