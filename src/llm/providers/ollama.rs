use crate::config::LlmConfig;
use crate::llm::models::{ChatMessage, ChatResponse, Role, ToolCall, ToolSpec};
use crate::llm::{ChatModel, LlmError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info};

const DEFAULT_API_URL: &str = "http://localhost:11434/api/chat";

pub struct OllamaProvider {
    client: reqwest::Client,
    api_url: String,
    model: String,
    temperature: f32,
}

#[derive(Serialize, Debug)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    options: OllamaOptions,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OllamaTool>,
}

#[derive(Serialize, Debug)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Serialize, Deserialize, Debug)]
struct OllamaMessage {
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OllamaToolCall>,
}

#[derive(Serialize, Deserialize, Debug)]
struct OllamaToolCall {
    function: OllamaFunction,
}

#[derive(Serialize, Deserialize, Debug)]
struct OllamaFunction {
    name: String,
    // Ollama sends arguments as a JSON object, not a string
    #[serde(default)]
    arguments: Value,
}

#[derive(Serialize, Debug)]
struct OllamaTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: OllamaToolDef,
}

#[derive(Serialize, Debug)]
struct OllamaToolDef {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Deserialize, Debug)]
struct OllamaResponse {
    message: OllamaMessage,
}

impl OllamaProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let provider = &config.ollama;
        let api_url = provider
            .api_url
            .clone()
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());

        Ok(Self {
            client: super::http_client(config.request_timeout_secs)?,
            api_url,
            model: provider.model.clone(),
            temperature: config.temperature,
        })
    }
}

fn to_wire(message: &ChatMessage) -> OllamaMessage {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    OllamaMessage {
        role: role.to_string(),
        content: message.content.clone(),
        tool_calls: message
            .tool_call
            .iter()
            .map(|call| OllamaToolCall {
                function: OllamaFunction {
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                },
            })
            .collect(),
    }
}

fn parse_message(message: OllamaMessage) -> ChatResponse {
    match message.tool_calls.into_iter().next() {
        // Ollama does not assign call ids
        Some(call) => ChatResponse::ToolCall(ToolCall {
            id: uuid::Uuid::new_v4().to_string(),
            name: call.function.name,
            arguments: call.function.arguments,
        }),
        None => ChatResponse::Text(message.content),
    }
}

#[async_trait]
impl ChatModel for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<ChatResponse, LlmError> {
        info!("Sending request to Ollama with model: {}", self.model);
        debug!("API URL: {}", self.api_url);

        let request = OllamaRequest {
            model: self.model.clone(),
            messages: messages.iter().map(to_wire).collect(),
            stream: false,
            options: OllamaOptions {
                temperature: self.temperature,
            },
            tools: tools
                .iter()
                .map(|t| OllamaTool {
                    kind: "function",
                    function: OllamaToolDef {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    },
                })
                .collect(),
        };

        let response = self.client.post(&self.api_url).json(&request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("Ollama API responded with status code: {} - {}", status, body);
            return Err(LlmError::from_status("Ollama", status, &body));
        }

        let response_text = response
            .text()
            .await
            .map_err(|e| LlmError::ResponseError(format!("Failed to read response body: {}", e)))?;

        debug!("Raw response from Ollama: {}", response_text);

        let ollama_response = serde_json::from_str::<OllamaResponse>(&response_text).map_err(|e| {
            error!("Failed to parse Ollama response: {} - Response was: {}", e, response_text);
            LlmError::ResponseError(format!("Failed to parse Ollama response: {}", e))
        })?;

        Ok(parse_message(ollama_response.message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_tool_calls_with_object_arguments() {
        let response: OllamaResponse = serde_json::from_value(json!({
            "model": "qwen2.5-coder",
            "message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [{"function": {"name": "run_query", "arguments": {"sql": "SELECT 1"}}}]
            },
            "done": true
        }))
        .unwrap();

        match parse_message(response.message) {
            ChatResponse::ToolCall(call) => {
                assert_eq!(call.name, "run_query");
                assert_eq!(call.str_arg("sql"), Some("SELECT 1"));
                assert!(!call.id.is_empty());
            }
            other => panic!("expected tool call, got {:?}", other),
        }
    }
}
