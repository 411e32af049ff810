pub mod anthropic;
pub mod ollama;
pub mod remote;

use crate::llm::LlmError;
use std::time::Duration;

pub(crate) fn http_client(timeout_secs: u64) -> Result<reqwest::Client, LlmError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| LlmError::ConnectionError(e.to_string()))
}
