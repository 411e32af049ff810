use crate::config::LlmConfig;
use crate::llm::models::{ChatMessage, ChatResponse, Role, ToolCall, ToolSpec};
use crate::llm::{ChatModel, LlmError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

const DEFAULT_API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

/// Anthropic Messages API.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: usize,
}

#[derive(Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: usize,
    temperature: f32,
    #[serde(skip_serializing_if = "String::is_empty")]
    system: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Tool>,
}

#[derive(Serialize)]
struct Message {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Serialize)]
struct Tool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

impl AnthropicProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let provider = &config.anthropic;
        let api_key = provider.api_key.clone().ok_or_else(|| {
            LlmError::ConfigError("API key is required for the Anthropic provider".to_string())
        })?;

        Ok(Self {
            client: super::http_client(config.request_timeout_secs)?,
            api_url: provider
                .api_url
                .clone()
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            api_key,
            model: provider.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

/// Splits out system text and folds the rest into alternating user/assistant
/// turns; tool results travel as user content blocks.
fn build_messages(messages: &[ChatMessage]) -> (String, Vec<Message>) {
    let mut system = Vec::new();
    let mut out: Vec<Message> = Vec::new();

    for message in messages {
        let (role, block) = match message.role {
            Role::System => {
                system.push(message.content.clone());
                continue;
            }
            Role::User => ("user", ContentBlock::Text {
                text: message.content.clone(),
            }),
            Role::Tool => ("user", ContentBlock::ToolResult {
                tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                content: message.content.clone(),
            }),
            Role::Assistant => match &message.tool_call {
                Some(call) => ("assistant", ContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.arguments.clone(),
                }),
                None => ("assistant", ContentBlock::Text {
                    text: message.content.clone(),
                }),
            },
        };

        match out.last_mut() {
            Some(last) if last.role == role => last.content.push(block),
            _ => out.push(Message {
                role,
                content: vec![block],
            }),
        }
    }

    (system.join("\n\n"), out)
}

fn parse_response(response: MessagesResponse) -> ChatResponse {
    let mut text = Vec::new();
    for block in response.content {
        match block {
            ContentBlock::ToolUse { id, name, input } => {
                return ChatResponse::ToolCall(ToolCall {
                    id,
                    name,
                    arguments: input,
                });
            }
            ContentBlock::Text { text: t } => text.push(t),
            _ => {}
        }
    }
    ChatResponse::Text(text.join("\n"))
}

#[async_trait]
impl ChatModel for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<ChatResponse, LlmError> {
        let (system, messages) = build_messages(messages);
        let request = MessagesRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            system,
            messages,
            tools: tools
                .iter()
                .map(|t| Tool {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    input_schema: t.parameters.clone(),
                })
                .collect(),
        };

        debug!("Sending request to Anthropic with model {}", self.model);

        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status("Anthropic", status, &body));
        }

        let body: MessagesResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ResponseError(e.to_string()))?;

        Ok(parse_response(body))
    }
}
