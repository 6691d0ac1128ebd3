//! Assembly of streamed content-block events into finished blocks.
//!
//! The endpoint delivers start/delta/stop triples per block. Text deltas
//! accumulate into the current text block, JSON deltas into the current
//! tool-use block; block-stop finalizes. Server-side tool blocks arrive
//! whole at block-start and pass through untouched.

use serde_json::{Value, json};
use tracing::warn;

use crate::error::LlmError;
use crate::types::ContentBlock;

#[derive(Debug)]
enum Pending {
    Text(String),
    ToolUse { id: String, name: String, json: String },
}

/// Accumulates one streamed assistant response.
#[derive(Debug, Default)]
pub struct BlockAssembler {
    blocks: Vec<ContentBlock>,
    current: Option<Pending>,
}

impl BlockAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one parsed stream event. Returns an error only for protocol-level
    /// failures the caller should classify (e.g. an in-band error event).
    pub fn handle_event(&mut self, event: &Value) -> Result<(), LlmError> {
        match event.get("type").and_then(Value::as_str) {
            Some("content_block_start") => self.on_block_start(event),
            Some("content_block_delta") => self.on_block_delta(event),
            Some("content_block_stop") => self.on_block_stop(),
            Some("error") => {
                let kind = event
                    .pointer("/error/type")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                let message = event
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                Err(LlmError::Api { kind, message })
            }
            // message_start / message_delta / message_stop / ping carry
            // nothing the assembler needs.
            _ => Ok(()),
        }
    }

    fn on_block_start(&mut self, event: &Value) -> Result<(), LlmError> {
        let Some(block) = event.get("content_block") else {
            return Ok(());
        };
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                let initial = block.get("text").and_then(Value::as_str).unwrap_or("");
                self.current = Some(Pending::Text(initial.to_string()));
            }
            Some("tool_use") => {
                let id = block.get("id").and_then(Value::as_str).unwrap_or("").to_string();
                let name = block.get("name").and_then(Value::as_str).unwrap_or("").to_string();
                self.current = Some(Pending::ToolUse {
                    id,
                    name,
                    json: String::new(),
                });
            }
            // Server-side tool blocks arrive complete; keep them verbatim.
            Some(_) => {
                self.blocks.push(ContentBlock::Server(block.clone()));
                self.current = None;
            }
            None => {}
        }
        Ok(())
    }

    fn on_block_delta(&mut self, event: &Value) -> Result<(), LlmError> {
        let Some(delta) = event.get("delta") else {
            return Ok(());
        };
        match (&mut self.current, delta.get("type").and_then(Value::as_str)) {
            (Some(Pending::Text(text)), Some("text_delta")) => {
                if let Some(piece) = delta.get("text").and_then(Value::as_str) {
                    text.push_str(piece);
                }
            }
            (Some(Pending::ToolUse { json, .. }), Some("input_json_delta")) => {
                if let Some(piece) = delta.get("partial_json").and_then(Value::as_str) {
                    json.push_str(piece);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn on_block_stop(&mut self) -> Result<(), LlmError> {
        match self.current.take() {
            Some(Pending::Text(text)) => self.blocks.push(ContentBlock::Text { text }),
            Some(Pending::ToolUse { id, name, json: raw }) => {
                let input = if raw.is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&raw).unwrap_or_else(|err| {
                        warn!(tool = %name, %err, "failed to parse streamed tool input; using empty object");
                        json!({})
                    })
                };
                self.blocks.push(ContentBlock::ToolUse { id, name, input });
            }
            None => {}
        }
        Ok(())
    }

    /// Consume the assembler at end of stream. A stream that ends mid-block
    /// is a retryable stream error.
    pub fn finish(self) -> Result<Vec<ContentBlock>, LlmError> {
        if self.current.is_some() {
            return Err(LlmError::Stream("stream ended inside a content block".into()));
        }
        Ok(self.blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(assembler: &mut BlockAssembler, events: &[Value]) {
        for event in events {
            assembler.handle_event(event).unwrap();
        }
    }

    #[test]
    fn assembles_text_from_deltas() {
        let mut assembler = BlockAssembler::new();
        feed(
            &mut assembler,
            &[
                json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
                json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "Hel"}}),
                json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "lo"}}),
                json!({"type": "content_block_stop"}),
            ],
        );
        let blocks = assembler.finish().unwrap();
        assert_eq!(blocks, vec![ContentBlock::text("Hello")]);
    }

    #[test]
    fn assembles_tool_use_from_json_deltas() {
        let mut assembler = BlockAssembler::new();
        feed(
            &mut assembler,
            &[
                json!({"type": "content_block_start", "content_block": {"type": "tool_use", "id": "toolu_1", "name": "bash"}}),
                json!({"type": "content_block_delta", "delta": {"type": "input_json_delta", "partial_json": "{\"comm"}}),
                json!({"type": "content_block_delta", "delta": {"type": "input_json_delta", "partial_json": "and\": \"ls\"}"}}),
                json!({"type": "content_block_stop"}),
            ],
        );
        let blocks = assembler.finish().unwrap();
        match &blocks[0] {
            ContentBlock::ToolUse { id, name, input } => {
                assert_eq!(id, "toolu_1");
                assert_eq!(name, "bash");
                assert_eq!(input["command"], "ls");
            }
            other => panic!("expected tool_use, got {other:?}"),
        }
    }

    #[test]
    fn malformed_tool_json_becomes_empty_object() {
        let mut assembler = BlockAssembler::new();
        feed(
            &mut assembler,
            &[
                json!({"type": "content_block_start", "content_block": {"type": "tool_use", "id": "t", "name": "bash"}}),
                json!({"type": "content_block_delta", "delta": {"type": "input_json_delta", "partial_json": "{not json"}}),
                json!({"type": "content_block_stop"}),
            ],
        );
        let blocks = assembler.finish().unwrap();
        match &blocks[0] {
            ContentBlock::ToolUse { input, .. } => assert_eq!(input, &json!({})),
            other => panic!("expected tool_use, got {other:?}"),
        }
    }

    #[test]
    fn empty_tool_input_becomes_empty_object() {
        let mut assembler = BlockAssembler::new();
        feed(
            &mut assembler,
            &[
                json!({"type": "content_block_start", "content_block": {"type": "tool_use", "id": "t", "name": "bash_status"}}),
                json!({"type": "content_block_stop"}),
            ],
        );
        let blocks = assembler.finish().unwrap();
        match &blocks[0] {
            ContentBlock::ToolUse { input, .. } => assert_eq!(input, &json!({})),
            other => panic!("expected tool_use, got {other:?}"),
        }
    }

    #[test]
    fn server_tool_blocks_pass_through() {
        let server_block = json!({"type": "web_search_tool_result", "tool_use_id": "srv_1", "content": []});
        let mut assembler = BlockAssembler::new();
        feed(
            &mut assembler,
            &[
                json!({"type": "content_block_start", "content_block": server_block}),
                json!({"type": "content_block_stop"}),
            ],
        );
        let blocks = assembler.finish().unwrap();
        assert_eq!(blocks, vec![ContentBlock::Server(server_block)]);
    }

    #[test]
    fn blocks_arrive_in_stream_order() {
        let mut assembler = BlockAssembler::new();
        feed(
            &mut assembler,
            &[
                json!({"type": "content_block_start", "content_block": {"type": "text", "text": "first"}}),
                json!({"type": "content_block_stop"}),
                json!({"type": "content_block_start", "content_block": {"type": "tool_use", "id": "a", "name": "bash"}}),
                json!({"type": "content_block_stop"}),
                json!({"type": "content_block_start", "content_block": {"type": "tool_use", "id": "b", "name": "list_files"}}),
                json!({"type": "content_block_stop"}),
            ],
        );
        let blocks = assembler.finish().unwrap();
        assert_eq!(blocks.len(), 3);
        assert!(matches!(&blocks[0], ContentBlock::Text { text } if text == "first"));
        assert!(matches!(&blocks[1], ContentBlock::ToolUse { id, .. } if id == "a"));
        assert!(matches!(&blocks[2], ContentBlock::ToolUse { id, .. } if id == "b"));
    }

    #[test]
    fn truncated_stream_is_a_stream_error() {
        let mut assembler = BlockAssembler::new();
        feed(
            &mut assembler,
            &[
                json!({"type": "content_block_start", "content_block": {"type": "text", "text": "partial"}}),
            ],
        );
        let err = assembler.finish().unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn in_band_error_event_surfaces_as_api_error() {
        let mut assembler = BlockAssembler::new();
        let err = assembler
            .handle_event(&json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}))
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn ping_and_message_events_are_ignored() {
        let mut assembler = BlockAssembler::new();
        feed(
            &mut assembler,
            &[
                json!({"type": "message_start", "message": {}}),
                json!({"type": "ping"}),
                json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}}),
                json!({"type": "message_stop"}),
            ],
        );
        assert!(assembler.finish().unwrap().is_empty());
    }
}
