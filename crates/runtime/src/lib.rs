//! Conversation runtime: the LLM↔tool loop, the conversation registry, and
//! the on-disk runtime layout.
//!
//! Ingress is deliberately abstracted: anything that can call
//! [`Runtime::handle_prompt`] with a stable conversation id and deliver the
//! returned reply text is a valid transport.

pub mod driver;
pub mod layout;
pub mod runtime;

pub use driver::{DriverConfig, ToolRoute, TurnDriver, TurnOutcome};
pub use layout::{ConversationDirs, RuntimeLayout};
pub use runtime::{Conversation, Runtime, RuntimeStats};
