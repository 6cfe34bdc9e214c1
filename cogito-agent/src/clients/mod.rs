use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }
}

/// One entry in the context window sent to the reasoning backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    /// Correlates a tool-role message back to the call that produced it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn tool(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
            name: Some(tool_name.into()),
        }
    }

    fn plain(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }
}

/// A tool invocation requested by the backend within one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Tool schema advertised to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingOptions {
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: None,
        }
    }
}

/// One structured backend turn: free text and/or tool-call requests.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LlmResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    RequestFailed(String),
    #[error("API error: {0}")]
    ApiError(String),
    #[error("malformed response: {0}")]
    ParseError(String),
    #[error("configuration error: {0}")]
    ConfigError(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// Reasoning backend. The engine keeps one outstanding call per chain;
/// cancelling an in-flight call is dropping its future.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        sampling: &SamplingOptions,
    ) -> Result<LlmResponse, LlmError>;

    fn model_info(&self) -> ModelInfo;
}

/// Chat-completions client for OpenAI-compatible endpoints.
pub struct OpenAIClient {
    api_key: String,
    model: String,
    client: reqwest::Client,
    base_url: String,
}

impl OpenAIClient {
    pub fn new(api_key: String, model: String, base_url: Option<String>) -> Self {
        Self {
            api_key,
            model,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(600))
                .build()
                .unwrap_or_default(),
            base_url: base_url
                .unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".to_string()),
        }
    }

    fn build_request(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        sampling: &SamplingOptions,
    ) -> Value {
        let messages_json: Vec<Value> = messages
            .iter()
            .map(|msg| {
                let mut map = serde_json::Map::new();
                map.insert(
                    "role".to_string(),
                    Value::String(msg.role.as_str().to_string()),
                );
                map.insert("content".to_string(), Value::String(msg.content.clone()));

                if let Some(tool_calls) = &msg.tool_calls {
                    let calls: Vec<Value> = tool_calls
                        .iter()
                        .map(|tc| {
                            serde_json::json!({
                                "id": tc.id,
                                "type": "function",
                                "function": {
                                    "name": tc.name,
                                    "arguments": tc.arguments.to_string()
                                }
                            })
                        })
                        .collect();
                    map.insert("tool_calls".to_string(), Value::Array(calls));
                }
                if let Some(id) = &msg.tool_call_id {
                    map.insert("tool_call_id".to_string(), Value::String(id.clone()));
                }
                if let Some(name) = &msg.name {
                    map.insert("name".to_string(), Value::String(name.clone()));
                }

                Value::Object(map)
            })
            .collect();

        let mut request = serde_json::Map::new();
        request.insert("model".to_string(), Value::String(self.model.clone()));
        request.insert("messages".to_string(), Value::Array(messages_json));
        request.insert(
            "temperature".to_string(),
            serde_json::json!(sampling.temperature),
        );
        if let Some(max_tokens) = sampling.max_tokens {
            request.insert("max_tokens".to_string(), serde_json::json!(max_tokens));
        }

        if !tools.is_empty() {
            let tools_json: Vec<Value> = tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters
                        }
                    })
                })
                .collect();
            request.insert("tools".to_string(), Value::Array(tools_json));
            request.insert("tool_choice".to_string(), Value::String("auto".to_string()));
        }

        Value::Object(request)
    }

    fn parse_response(body: &Value) -> Result<LlmResponse, LlmError> {
        if let Some(error) = body.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown API error");
            return Err(LlmError::ApiError(message.to_string()));
        }

        let message = body
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .ok_or_else(|| LlmError::ParseError("response carries no choices".to_string()))?;

        let content = message
            .get("content")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let mut tool_calls = Vec::new();
        if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                let id = call
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| LlmError::ParseError("tool call without id".to_string()))?;
                let function = call.get("function").ok_or_else(|| {
                    LlmError::ParseError("tool call without function".to_string())
                })?;
                let name = function
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| LlmError::ParseError("tool call without name".to_string()))?;
                let raw_args = function
                    .get("arguments")
                    .and_then(Value::as_str)
                    .unwrap_or("{}");

                // Malformed argument JSON is preserved for the validator to
                // reject instead of failing the whole turn.
                let arguments = serde_json::from_str(raw_args)
                    .unwrap_or_else(|_| serde_json::json!({ "input": raw_args }));

                tool_calls.push(ToolCallRequest {
                    id: id.to_string(),
                    name: name.to_string(),
                    arguments,
                });
            }
        }

        Ok(LlmResponse {
            content,
            tool_calls,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        sampling: &SamplingOptions,
    ) -> Result<LlmResponse, LlmError> {
        let request = self.build_request(messages, tools, sampling);

        let response = self
            .client
            .post(&self.base_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;

        Self::parse_response(&body)
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            name: self.model.clone(),
            max_tokens: Some(16384),
        }
    }
}

pub fn create_llm_client(
    provider: &str,
    api_key: String,
    model: String,
    base_url: Option<String>,
) -> Result<Box<dyn LlmClient>, LlmError> {
    match provider {
        "openai" | "OpenAI" => Ok(Box::new(OpenAIClient::new(api_key, model, base_url))),
        _ => Err(LlmError::ConfigError(format!(
            "unknown provider: {provider}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_content_and_tool_calls() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": "Let me compute that.",
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {
                            "name": "calculator",
                            "arguments": "{\"expression\": \"12*12\"}"
                        }
                    }]
                }
            }]
        });

        let response = OpenAIClient::parse_response(&body).unwrap();
        assert_eq!(response.content.as_deref(), Some("Let me compute that."));
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "calculator");
        assert_eq!(
            response.tool_calls[0].arguments,
            json!({"expression": "12*12"})
        );
    }

    #[test]
    fn malformed_arguments_become_raw_input() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "function": { "name": "calculator", "arguments": "not json" }
                    }]
                }
            }]
        });

        let response = OpenAIClient::parse_response(&body).unwrap();
        assert_eq!(
            response.tool_calls[0].arguments,
            json!({"input": "not json"})
        );
    }

    #[test]
    fn api_errors_are_surfaced() {
        let body = json!({"error": {"message": "rate limited"}});
        let err = OpenAIClient::parse_response(&body).unwrap_err();
        assert!(matches!(err, LlmError::ApiError(msg) if msg == "rate limited"));
    }

    #[test]
    fn missing_choices_is_a_parse_error() {
        let err = OpenAIClient::parse_response(&json!({})).unwrap_err();
        assert!(matches!(err, LlmError::ParseError(_)));
    }

    #[test]
    fn request_includes_tools_and_sampling() {
        let client = OpenAIClient::new("key".to_string(), "gpt-4o".to_string(), None);
        let tools = vec![ToolDefinition {
            name: "calculator".to_string(),
            description: "math".to_string(),
            parameters: json!({"type": "object"}),
        }];
        let sampling = SamplingOptions {
            temperature: 0.2,
            max_tokens: Some(512),
        };

        let request = client.build_request(&[Message::user("hi")], &tools, &sampling);
        assert_eq!(request["tool_choice"], json!("auto"));
        assert_eq!(request["max_tokens"], json!(512));
        assert_eq!(request["tools"][0]["function"]["name"], json!("calculator"));
    }
}
