pub mod extract;
pub mod models;
pub mod prompts;
pub mod providers;
pub mod retry;

use crate::config::LlmConfig;
use crate::util::metrics::PipelineMetrics;
use async_trait::async_trait;
use models::{ChatMessage, ChatResponse, ToolSpec};
use retry::RetryPolicy;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug)]
pub enum LlmError {
    ConnectionError(String),
    RateLimited(String),
    ResponseError(String),
    ConfigError(String),
    Exhausted(Vec<String>),
}

impl LlmError {
    /// Network failures, timeouts, 429s and 5xx responses are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, LlmError::ConnectionError(_) | LlmError::RateLimited(_))
    }

    /// Maps a non-success HTTP status to the matching error kind.
    pub fn from_status(provider: &str, status: reqwest::StatusCode, body: &str) -> Self {
        let msg = format!("{} API responded with status code: {} - {}", provider, status, body);
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            LlmError::RateLimited(msg)
        } else if status.is_server_error() {
            LlmError::ConnectionError(msg)
        } else {
            LlmError::ResponseError(msg)
        }
    }
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::ConnectionError(msg) => write!(f, "LLM connection error: {}", msg),
            LlmError::RateLimited(msg) => write!(f, "LLM rate limited: {}", msg),
            LlmError::ResponseError(msg) => write!(f, "LLM response error: {}", msg),
            LlmError::ConfigError(msg) => write!(f, "LLM configuration error: {}", msg),
            LlmError::Exhausted(errors) => {
                write!(f, "all LLM providers failed: {}", errors.join("; "))
            }
        }
    }
}

impl Error for LlmError {}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            LlmError::ConnectionError(e.to_string())
        } else {
            LlmError::ResponseError(e.to_string())
        }
    }
}

/// A chat model that can optionally call tools.
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<ChatResponse, LlmError>;

    /// Tool-less system + user exchange returning the reply text.
    async fn complete(&self, system: &str, user: &str) -> Result<String, LlmError> {
        let messages = [ChatMessage::system(system), ChatMessage::user(user)];
        Ok(self.chat(&messages, &[]).await?.into_text())
    }
}

/// Fallback chain over the configured providers, each wrapped in retry.
pub struct LlmManager {
    providers: Vec<Box<dyn ChatModel>>,
    policy: RetryPolicy,
    metrics: Arc<PipelineMetrics>,
}

impl LlmManager {
    pub fn new(config: &LlmConfig, metrics: Arc<PipelineMetrics>) -> Result<Self, LlmError> {
        let mut chain: Vec<Box<dyn ChatModel>> = Vec::new();

        if has_key(&config.anthropic.api_key) {
            chain.push(Box::new(providers::anthropic::AnthropicProvider::new(config)?));
        }
        if has_key(&config.openai.api_key) {
            chain.push(Box::new(providers::remote::RemoteLlmProvider::new(config)?));
        }
        if config.ollama.enabled {
            chain.push(Box::new(providers::ollama::OllamaProvider::new(config)?));
        }

        if chain.is_empty() {
            return Err(LlmError::ConfigError(
                "No LLM provider configured; set an anthropic or openai API key, or enable ollama"
                    .to_string(),
            ));
        }

        let names: Vec<&str> = chain.iter().map(|p| p.name()).collect();
        info!("LLM fallback chain: {}", names.join(" -> "));

        Ok(Self::with_providers(chain, RetryPolicy::from_config(config), metrics))
    }

    pub fn with_providers(
        providers: Vec<Box<dyn ChatModel>>,
        policy: RetryPolicy,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            providers,
            policy,
            metrics,
        }
    }
}

fn has_key(key: &Option<String>) -> bool {
    key.as_deref().is_some_and(|k| !k.trim().is_empty())
}

#[async_trait]
impl ChatModel for LlmManager {
    fn name(&self) -> &str {
        "fallback-chain"
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<ChatResponse, LlmError> {
        let mut errors = Vec::new();

        for provider in &self.providers {
            let result = retry::with_retry(self.policy, &self.metrics, provider.name(), || {
                provider.chat(messages, tools)
            })
            .await;

            match result {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!("Provider {} failed, trying next: {}", provider.name(), e);
                    errors.push(format!("{}: {}", provider.name(), e));
                }
            }
        }

        Err(LlmError::Exhausted(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::metrics::Counter;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Flaky {
        name: String,
        failures: Mutex<Vec<LlmError>>,
        reply: Option<String>,
    }

    #[async_trait]
    impl ChatModel for Flaky {
        fn name(&self) -> &str {
            &self.name
        }

        async fn chat(&self, _: &[ChatMessage], _: &[ToolSpec]) -> Result<ChatResponse, LlmError> {
            if let Some(e) = self.failures.lock().unwrap().pop() {
                return Err(e);
            }
            match &self.reply {
                Some(text) => Ok(ChatResponse::Text(text.clone())),
                None => Err(LlmError::ResponseError("down".into())),
            }
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 2,
            min_wait: Duration::from_millis(1),
            max_wait: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn falls_back_to_next_provider() {
        let metrics = Arc::new(PipelineMetrics::new());
        let primary = Flaky {
            name: "primary".into(),
            failures: Mutex::new(vec![LlmError::ConnectionError("reset".into())]),
            reply: None,
        };
        let secondary = Flaky {
            name: "secondary".into(),
            failures: Mutex::new(Vec::new()),
            reply: Some("from secondary".into()),
        };
        let manager = LlmManager::with_providers(
            vec![Box::new(primary), Box::new(secondary)],
            policy(),
            metrics.clone(),
        );

        let reply = manager.complete("sys", "hi").await.unwrap();
        assert_eq!(reply, "from secondary");
        // one transient failure on the primary was retried before giving up on it
        assert_eq!(metrics.get(Counter::LlmRetries), 1);
    }

    #[tokio::test]
    async fn reports_exhaustion_when_every_provider_fails() {
        let manager = LlmManager::with_providers(
            vec![Box::new(Flaky {
                name: "only".into(),
                failures: Mutex::new(Vec::new()),
                reply: None,
            })],
            policy(),
            Arc::new(PipelineMetrics::new()),
        );

        let err = manager.complete("sys", "hi").await.unwrap_err();
        assert!(matches!(err, LlmError::Exhausted(ref e) if e.len() == 1));
    }

    #[test]
    fn unconfigured_chain_is_a_config_error() {
        let result = LlmManager::new(&LlmConfig::default(), Arc::new(PipelineMetrics::new()));
        assert!(matches!(result, Err(LlmError::ConfigError(_))));
    }
}
