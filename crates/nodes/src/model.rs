//! Model invocation client (LLM / ML endpoints).

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::transport::{is_retryable_status, HttpMethod, HttpRequest, HttpTransport, RequestBody};
use crate::NodeError;

pub const DEFAULT_CHAT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

/// A rendered prompt ready to send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub endpoint: String,
    pub model: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Ask the model for a JSON object.
    #[serde(default)]
    pub json_response: bool,
    #[serde(skip)]
    pub api_key: Option<String>,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Return the model's textual reply.
    async fn complete(&self, request: ModelRequest) -> Result<String, NodeError>;
}

/// OpenAI-compatible chat-completions client. Works with any endpoint that
/// speaks the same wire format.
pub struct ChatCompletionsClient {
    transport: Arc<dyn HttpTransport>,
}

impl ChatCompletionsClient {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl ModelClient for ChatCompletionsClient {
    async fn complete(&self, request: ModelRequest) -> Result<String, NodeError> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": request.prompt }));

        let mut body = json!({ "model": request.model, "messages": messages });
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(m) = request.max_tokens {
            body["max_tokens"] = json!(m);
        }
        if request.json_response {
            body["response_format"] = json!({ "type": "json_object" });
        }

        let mut http = HttpRequest::new(HttpMethod::POST, &request.endpoint)
            .with_body(RequestBody::Json(body));
        if let Some(key) = &request.api_key {
            http = http.header("Authorization", format!("Bearer {key}"));
        }

        let response = self.transport.send(http).await?;
        if !response.is_success() {
            return Err(NodeError::network(
                format!("model endpoint returned HTTP {}: {}", response.status, response.body),
                is_retryable_status(response.status),
            ));
        }

        let parsed: ChatResponse = serde_json::from_str(&response.body)
            .map_err(|e| NodeError::Model(format!("unparseable model response: {e}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| NodeError::Model("model response has no content".into()))
    }
}

/// Parse a reply that was requested as JSON, tolerating a fenced block.
pub fn parse_json_reply(reply: &str) -> Result<Value, NodeError> {
    let trimmed = reply.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(body.trim())
        .map_err(|e| NodeError::Model(format!("model reply is not valid JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;

    fn request() -> ModelRequest {
        ModelRequest {
            endpoint: "http://llm/v1/chat/completions".into(),
            model: "m".into(),
            system_prompt: Some("be terse".into()),
            prompt: "hi".into(),
            temperature: Some(0.0),
            max_tokens: None,
            json_response: false,
            api_key: Some("sk".into()),
        }
    }

    #[tokio::test]
    async fn extracts_first_choice_content() {
        let transport = Arc::new(MockTransport::new().respond_json(
            200,
            json!({ "choices": [ { "message": { "content": "hello" } } ] }),
        ));
        let client = ChatCompletionsClient::new(transport.clone());
        assert_eq!(client.complete(request()).await.unwrap(), "hello");

        let sent = &transport.requests()[0];
        assert_eq!(sent.header_value("Authorization"), Some("Bearer sk"));
        match &sent.body {
            Some(RequestBody::Json(body)) => assert_eq!(body["messages"][0]["role"], "system"),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_errors_are_retryable_network_errors() {
        let transport = Arc::new(MockTransport::new().respond_status(502));
        let client = ChatCompletionsClient::new(transport);
        let err = client.complete(request()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn json_reply_tolerates_fences() {
        assert_eq!(parse_json_reply("```json\n{\"a\":1}\n```").unwrap()["a"], 1);
        assert!(parse_json_reply("not json").is_err());
    }
}
