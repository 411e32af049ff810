use crate::config::LlmConfig;
use crate::llm::LlmError;
use crate::util::metrics::{Counter, PipelineMetrics};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub min_wait: Duration,
    pub max_wait: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            attempts: config.retry_attempts.max(1),
            min_wait: Duration::from_millis(config.retry_min_wait_ms),
            max_wait: Duration::from_millis(config.retry_max_wait_ms),
        }
    }

    /// Wait before retry number `attempt` (1-based): min * 2^(attempt-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.min_wait.saturating_mul(factor).min(self.max_wait)
    }
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// attempts are used up. Every retry is counted in `metrics`.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    metrics: &PipelineMetrics,
    label: &str,
    mut op: F,
) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.attempts => {
                let wait = policy.backoff(attempt);
                warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {}ms",
                    label,
                    attempt,
                    policy.attempts,
                    e,
                    wait.as_millis()
                );
                metrics.increment(Counter::LlmRetries);
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
