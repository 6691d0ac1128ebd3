//! Tool declaration, validation, and dispatch.
//!
//! A [`ToolProvider`] declares tools with typed schemas plus the global and
//! per-conversation state it needs. The [`ToolRegistry`] validates every
//! inbound call against the declared schema and routes it, stamping the
//! reserved conversation-id and working-directory keys. File and shell
//! adjacent providers confine model-supplied paths with [`resolve_path`].

pub mod builtins;
pub mod events;
pub mod overlay;
pub mod registry;
pub mod sandbox;
pub mod schema;
pub mod validate;

pub use events::{EventSink, TracingSink};
pub use overlay::Overlay;
pub use registry::{
    CONVERSATION_ID_KEY, ProviderInit, StateMap, ToolCallState, ToolProvider, ToolRegistry,
    ToolReply, WORKING_DIRECTORY_KEY,
};
pub use sandbox::resolve_path;
pub use schema::{Param, ParamKind, ToolDescriptor};
pub use validate::validate_call;
