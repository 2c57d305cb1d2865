//! OpenAI-compatible chat-completions provider over HTTP.

use crate::config::LlmConfig;
use crate::error::{LlmError, Result};
use crate::llm::provider::{
    ChatMessage, ChatOptions, ChatResponse, LlmProvider, Role, TokenUsage, ToolCall, ToolSpec,
};
use anyhow::Context as _;
use serde::Deserialize;

/// Provider speaking the `/chat/completions` wire format.
pub struct HttpProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl HttpProvider {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .with_context(|| "failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }

    fn request_body(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        options: &ChatOptions,
    ) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = messages.iter().map(wire_message).collect();

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
        });

        if !tools.is_empty() {
            let tools: Vec<serde_json::Value> = tools
                .iter()
                .map(|tool| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        },
                    })
                })
                .collect();
            body["tools"] = serde_json::Value::Array(tools);
        }
        if let Some(temperature) = options.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        body
    }
}

fn wire_message(message: &ChatMessage) -> serde_json::Value {
    let mut value = serde_json::json!({
        "role": message.role.as_str(),
        "content": message.content,
    });

    if !message.tool_calls.is_empty() {
        let calls: Vec<serde_json::Value> = message
            .tool_calls
            .iter()
            .map(|call| {
                serde_json::json!({
                    "id": call.id,
                    "type": "function",
                    "function": { "name": call.name, "arguments": call.arguments },
                })
            })
            .collect();
        value["tool_calls"] = serde_json::Value::Array(calls);
    }
    if message.role == Role::Tool
        && let Some(call_id) = &message.tool_call_id
    {
        value["tool_call_id"] = serde_json::json!(call_id);
    }

    value
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireAssistant,
}

#[derive(Debug, Deserialize)]
struct WireAssistant {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    #[serde(default)]
    prompt_tokens_details: Option<WirePromptDetails>,
    #[serde(default)]
    completion_tokens_details: Option<WireCompletionDetails>,
}

#[derive(Debug, Deserialize)]
struct WirePromptDetails {
    cached_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WireCompletionDetails {
    reasoning_tokens: Option<u64>,
}

impl LlmProvider for HttpProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        options: &ChatOptions,
    ) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut request = self.client.post(&url).json(&self.request_body(messages, tools, options));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|error| LlmError::Unavailable(error.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(LlmError::Unavailable(format!("provider returned {status}")).into());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::BadResponse(format!("provider returned {status}: {body}")).into());
        }

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|error| LlmError::BadResponse(format!("malformed response body: {error}")))?;

        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::BadResponse("response had no choices".into()))?;

        let tool_calls = choice
            .message
            .tool_calls
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                name: call.function.name,
                arguments: call.function.arguments,
            })
            .collect();

        let usage = wire.usage.map(|usage| TokenUsage {
            input: usage.prompt_tokens.unwrap_or(0),
            output: usage.completion_tokens.unwrap_or(0),
            cached: usage
                .prompt_tokens_details
                .and_then(|details| details.cached_tokens)
                .unwrap_or(0),
            reasoning: usage
                .completion_tokens_details
                .and_then(|details| details.reasoning_tokens)
                .unwrap_or(0),
        });

        Ok(ChatResponse {
            content: choice.message.content.unwrap_or_default(),
            tool_calls,
            usage,
            model: wire.model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> HttpProvider {
        HttpProvider::new(&LlmConfig {
            base_url: "http://localhost:9/v1/".into(),
            api_key: Some("sk-test".into()),
            model: "test-model".into(),
            request_timeout: std::time::Duration::from_secs(5),
        })
        .expect("provider")
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        assert_eq!(provider().base_url, "http://localhost:9/v1");
    }

    #[test]
    fn request_body_includes_tools_and_options() {
        let provider = provider();
        let messages = [ChatMessage::user("hi")];
        let tools = [ToolSpec {
            name: "current_time".into(),
            description: "tells the time".into(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
        }];
        let options = ChatOptions {
            temperature: Some(0.2),
            max_tokens: Some(256),
        };

        let body = provider.request_body(&messages, &tools, &options);
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["tools"][0]["function"]["name"], "current_time");
        assert_eq!(body["max_tokens"], 256);
    }

    #[test]
    fn tool_turns_carry_call_ids_on_the_wire() {
        let message = ChatMessage::tool_result("call_9", "done");
        let value = wire_message(&message);
        assert_eq!(value["role"], "tool");
        assert_eq!(value["tool_call_id"], "call_9");
    }

    #[test]
    fn assistant_tool_calls_serialize() {
        let message = ChatMessage::assistant_with_calls(
            "",
            vec![ToolCall {
                id: "c1".into(),
                name: "calc".into(),
                arguments: "{\"expression\":\"1+1\"}".into(),
            }],
        );
        let value = wire_message(&message);
        assert_eq!(value["tool_calls"][0]["function"]["name"], "calc");
    }
}
