//! Message history types and their wire representation.
//!
//! Blocks are plain enums; conversion to the endpoint's JSON happens in
//! explicit `to_wire` builders so unknown server-tool blocks can pass
//! through untouched.

use serde_json::{Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Content of a tool_result block: either a plain text payload or a list of
/// raw blocks (used for image results that feed the model's vision input).
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResultContent {
    Text(String),
    Blocks(Vec<Value>),
}

/// One content block inside a message.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
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
        content: ToolResultContent,
        is_error: bool,
    },
    Image {
        media_type: String,
        data: String,
    },
    /// Server-side tool blocks (server_tool_use, web_search_tool_result, …)
    /// carried through unchanged.
    Server(Value),
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn to_wire(&self) -> Value {
        match self {
            Self::Text { text } => json!({ "type": "text", "text": text }),
            Self::ToolUse { id, name, input } => json!({
                "type": "tool_use",
                "id": id,
                "name": name,
                "input": input,
            }),
            Self::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let content_wire = match content {
                    ToolResultContent::Text(text) => json!(text),
                    ToolResultContent::Blocks(blocks) => json!(blocks),
                };
                json!({
                    "type": "tool_result",
                    "tool_use_id": tool_use_id,
                    "content": content_wire,
                    "is_error": is_error,
                })
            }
            Self::Image { media_type, data } => json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": media_type,
                    "data": data,
                },
            }),
            Self::Server(raw) => raw.clone(),
        }
    }
}

/// A single message in the conversation history. Tool results travel in
/// user-role messages, per the endpoint contract.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::text(text)],
        }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }

    pub fn tool_results(results: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: results,
        }
    }

    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn to_wire(&self) -> Value {
        json!({
            "role": self.role.as_str(),
            "content": self.content.iter().map(ContentBlock::to_wire).collect::<Vec<_>>(),
        })
    }
}

/// Concatenate the text blocks of an assistant response.
pub fn collect_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_block_wire_shape() {
        let wire = ContentBlock::text("hello").to_wire();
        assert_eq!(wire["type"], "text");
        assert_eq!(wire["text"], "hello");
    }

    #[test]
    fn tool_use_wire_shape() {
        let block = ContentBlock::ToolUse {
            id: "toolu_1".into(),
            name: "bash".into(),
            input: json!({"command": "ls"}),
        };
        let wire = block.to_wire();
        assert_eq!(wire["type"], "tool_use");
        assert_eq!(wire["id"], "toolu_1");
        assert_eq!(wire["input"]["command"], "ls");
    }

    #[test]
    fn tool_result_text_wire_shape() {
        let block = ContentBlock::ToolResult {
            tool_use_id: "toolu_1".into(),
            content: ToolResultContent::Text("{\"ok\":true}".into()),
            is_error: false,
        };
        let wire = block.to_wire();
        assert_eq!(wire["tool_use_id"], "toolu_1");
        assert_eq!(wire["content"], "{\"ok\":true}");
        assert_eq!(wire["is_error"], false);
    }

    #[test]
    fn tool_result_rich_content_wire_shape() {
        let image = json!({"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "AAAA"}});
        let block = ContentBlock::ToolResult {
            tool_use_id: "toolu_2".into(),
            content: ToolResultContent::Blocks(vec![image.clone(), json!({"type": "text", "text": "loaded"})]),
            is_error: false,
        };
        let wire = block.to_wire();
        assert!(wire["content"].is_array());
        assert_eq!(wire["content"][0], image);
    }

    #[test]
    fn server_blocks_pass_through_unchanged() {
        let raw = json!({"type": "server_tool_use", "id": "srvtoolu_1", "name": "web_search", "input": {"query": "rust"}});
        assert_eq!(ContentBlock::Server(raw.clone()).to_wire(), raw);
    }

    #[test]
    fn message_text_concatenates_text_blocks_only() {
        let message = Message::assistant(vec![
            ContentBlock::text("one "),
            ContentBlock::ToolUse {
                id: "t".into(),
                name: "bash".into(),
                input: json!({}),
            },
            ContentBlock::text("two"),
        ]);
        assert_eq!(message.text(), "one two");
    }

    #[test]
    fn message_wire_carries_role() {
        let wire = Message::user_text("hi").to_wire();
        assert_eq!(wire["role"], "user");
        assert_eq!(wire["content"][0]["text"], "hi");

        let wire = Message::tool_results(vec![]).to_wire();
        assert_eq!(wire["role"], "user");
    }
}
