//! Streaming client for an Anthropic-style Messages endpoint.
//!
//! The crate owns the wire protocol only: content-block types, the
//! server-sent event assembler, the HTTP client, and the error taxonomy the
//! retry loop classifies against. The conversation loop itself (retry,
//! backup-model fallback, tool dispatch) lives in dockhand-runtime.

pub mod builtin;
pub mod client;
pub mod error;
pub mod stream;
pub mod types;

pub use builtin::BuiltinTool;
pub use client::{AnthropicClient, CompletionRequest, ModelApi};
pub use error::LlmError;
pub use stream::BlockAssembler;
pub use types::{ContentBlock, Message, Role, ToolResultContent, collect_text};
