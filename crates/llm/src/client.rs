//! HTTP client for the streaming Messages endpoint.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::LlmError;
use crate::stream::BlockAssembler;
use crate::types::{ContentBlock, Message};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Everything one model call needs. Built once per call; the retry loop
/// re-sends the same request (with a different model id after fallback).
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub system: Option<String>,
    pub max_tokens: u32,
    pub messages: Vec<Value>,
    pub tools: Vec<Value>,
    /// Extra headers, e.g. `anthropic-beta` for server-side built-in tools.
    pub extra_headers: Vec<(String, String)>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, max_tokens: u32, messages: &[Message]) -> Self {
        Self {
            model: model.into(),
            system: None,
            max_tokens,
            messages: messages.iter().map(Message::to_wire).collect(),
            tools: vec![],
            extra_headers: vec![],
        }
    }

    pub fn to_wire(&self) -> Value {
        let mut payload = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": self.messages,
            "stream": true,
        });
        if let Some(system) = &self.system {
            if !system.is_empty() {
                payload["system"] = json!(system);
            }
        }
        if !self.tools.is_empty() {
            payload["tools"] = json!(self.tools);
        }
        payload
    }
}

/// One streamed model call, no retry. The conversation driver supplies the
/// retry and fallback policy around this seam, which also makes the driver
/// testable against a scripted implementation.
#[async_trait]
pub trait ModelApi: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Vec<ContentBlock>, LlmError>;
}

#[derive(Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

// Debug omits the API key.
impl std::fmt::Debug for AnthropicClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ModelApi for AnthropicClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Vec<ContentBlock>, LlmError> {
        let endpoint = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));

        let mut builder = self
            .http
            .post(&endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request.to_wire());
        for (name, value) in &request.extra_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let mut response = builder.send().await.map_err(LlmError::from_transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status.as_u16(), body));
        }

        // SSE lines can split across chunks; buffer and drain whole lines.
        let mut assembler = BlockAssembler::new();
        let mut buffer = String::new();
        while let Some(chunk) = response.chunk().await.map_err(LlmError::from_transport)? {
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(newline) = buffer.find('\n') {
                let line: String = buffer.drain(..=newline).collect();
                handle_sse_line(line.trim_end(), &mut assembler)?;
            }
        }
        if !buffer.is_empty() {
            handle_sse_line(buffer.trim_end(), &mut assembler)?;
        }

        let blocks = assembler.finish()?;
        debug!(model = %request.model, blocks = blocks.len(), "model response assembled");
        Ok(blocks)
    }
}

fn handle_sse_line(line: &str, assembler: &mut BlockAssembler) -> Result<(), LlmError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with("event:") || line.starts_with(':') {
        return Ok(());
    }
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(());
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(());
    }
    let Ok(event) = serde_json::from_str::<Value>(data) else {
        // A half-received JSON payload means the transport chopped the
        // stream; surface as a retryable stream error.
        return Err(LlmError::Stream(format!("unparseable event payload: {data}")));
    };
    assembler.handle_event(&event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    #[test]
    fn request_wire_shape() {
        let messages = vec![Message::user_text("hi")];
        let mut request = CompletionRequest::new("claude-test", 1024, &messages);
        request.system = Some("be brief".into());
        request.tools = vec![json!({"name": "bash"})];

        let wire = request.to_wire();
        assert_eq!(wire["model"], "claude-test");
        assert_eq!(wire["max_tokens"], 1024);
        assert_eq!(wire["stream"], true);
        assert_eq!(wire["system"], "be brief");
        assert_eq!(wire["messages"][0]["role"], "user");
        assert_eq!(wire["tools"][0]["name"], "bash");
    }

    #[test]
    fn empty_system_and_tools_are_omitted() {
        let messages = vec![Message {
            role: Role::User,
            content: vec![ContentBlock::text("hi")],
        }];
        let mut request = CompletionRequest::new("m", 10, &messages);
        request.system = Some(String::new());

        let wire = request.to_wire();
        assert!(wire.get("system").is_none());
        assert!(wire.get("tools").is_none());
    }

    #[test]
    fn sse_line_routing() {
        let mut assembler = BlockAssembler::new();
        handle_sse_line("event: content_block_start", &mut assembler).unwrap();
        handle_sse_line(": keepalive comment", &mut assembler).unwrap();
        handle_sse_line("", &mut assembler).unwrap();
        handle_sse_line(
            r#"data: {"type":"content_block_start","content_block":{"type":"text","text":"hi"}}"#,
            &mut assembler,
        )
        .unwrap();
        handle_sse_line(r#"data: {"type":"content_block_stop"}"#, &mut assembler).unwrap();

        let blocks = assembler.finish().unwrap();
        assert_eq!(blocks, vec![ContentBlock::text("hi")]);
    }

    #[test]
    fn garbled_data_line_is_a_stream_error() {
        let mut assembler = BlockAssembler::new();
        let err = handle_sse_line("data: {\"type\": \"content_bl", &mut assembler).unwrap_err();
        assert!(err.is_retryable());
    }
}
