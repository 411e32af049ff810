use crate::config::LlmConfig;
use crate::llm::models::{ChatMessage, ChatResponse, Role, ToolCall, ToolSpec};
use crate::llm::{ChatModel, LlmError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible chat completions endpoint.
pub struct RemoteLlmProvider {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: usize,
}

#[derive(Serialize)]
struct PromptRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    max_tokens: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Tool>,
}

#[derive(Serialize)]
struct Message {
    role: &'static str,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OutgoingToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize)]
struct OutgoingToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    function: FunctionCall,
}

#[derive(Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    // JSON-encoded string on the wire
    arguments: String,
}

#[derive(Serialize)]
struct Tool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: FunctionDef,
}

#[derive(Serialize)]
struct FunctionDef {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Deserialize)]
struct PromptResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<IncomingToolCall>,
}

#[derive(Deserialize)]
struct IncomingToolCall {
    id: String,
    function: FunctionCall,
}

impl RemoteLlmProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let provider = &config.openai;
        let api_key = provider.api_key.clone().ok_or_else(|| {
            LlmError::ConfigError("API key is required for the OpenAI provider".to_string())
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

fn to_wire(message: &ChatMessage) -> Message {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };

    let tool_calls = message.tool_call.as_ref().map(|call| {
        vec![OutgoingToolCall {
            id: call.id.clone(),
            kind: "function",
            function: FunctionCall {
                name: call.name.clone(),
                arguments: call.arguments.to_string(),
            },
        }]
    });

    Message {
        role,
        content: if tool_calls.is_some() && message.content.is_empty() {
            None
        } else {
            Some(message.content.clone())
        },
        tool_calls,
        tool_call_id: message.tool_call_id.clone(),
    }
}

fn parse_response(response: PromptResponse) -> Result<ChatResponse, LlmError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::ResponseError("No choices in response".to_string()))?;

    if let Some(call) = choice.message.tool_calls.into_iter().next() {
        let arguments = serde_json::from_str(&call.function.arguments).map_err(|e| {
            LlmError::ResponseError(format!("Tool arguments are not valid JSON: {}", e))
        })?;
        return Ok(ChatResponse::ToolCall(ToolCall {
            id: call.id,
            name: call.function.name,
            arguments,
        }));
    }

    Ok(ChatResponse::Text(choice.message.content.unwrap_or_default()))
}

#[async_trait]
impl ChatModel for RemoteLlmProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<ChatResponse, LlmError> {
        let request = PromptRequest {
            model: self.model.clone(),
            messages: messages.iter().map(to_wire).collect(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tools: tools
                .iter()
                .map(|t| Tool {
                    kind: "function",
                    function: FunctionDef {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    },
                })
                .collect(),
        };

        debug!("Sending request to {} with model {}", self.api_url, self.model);

        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status("OpenAI", status, &body));
        }

        let prompt_response: PromptResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ResponseError(e.to_string()))?;

        parse_response(prompt_response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_call_round_trips_through_wire_format() {
        let call = ToolCall {
            id: "call_1".into(),
            name: "run_query".into(),
            arguments: json!({"sql": "SELECT 1"}),
        };
        let wire = serde_json::to_value(to_wire(&ChatMessage::assistant_tool_call(call))).unwrap();
        assert_eq!(wire["content"], Value::Null);
        assert_eq!(wire["tool_calls"][0]["function"]["arguments"], "{\"sql\":\"SELECT 1\"}");

        let response: PromptResponse = serde_json::from_value(json!({
            "choices": [{"message": {"content": null, "tool_calls": [
                {"id": "call_2", "type": "function",
                 "function": {"name": "run_query", "arguments": "{\"sql\": \"SELECT 2\"}"}}
            ]}}]
        }))
        .unwrap();
        match parse_response(response).unwrap() {
            ChatResponse::ToolCall(call) => {
                assert_eq!(call.id, "call_2");
                assert_eq!(call.str_arg("sql"), Some("SELECT 2"));
            }
            other => panic!("expected tool call, got {:?}", other),
        }
    }

    #[test]
    fn plain_content_is_text() {
        let response: PromptResponse = serde_json::from_value(json!({
            "choices": [{"message": {"content": "There are 42 tracks."}}]
        }))
        .unwrap();
        assert_eq!(
            parse_response(response).unwrap(),
            ChatResponse::Text("There are 42 tracks.".into())
        );
    }
}
