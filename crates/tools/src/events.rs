//! Best-effort observability for tool dispatch.

use tracing::info;

/// Sink for "tool call" events. Arguments are deliberately not included;
/// only the conversation, tool id, and display name. Implementations must
/// never fail the dispatch: swallow errors internally.
pub trait EventSink: Send + Sync {
    fn tool_called(&self, conversation_id: &str, tool_id: &str, display_name: &str);
}

/// Default sink: structured log lines.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn tool_called(&self, conversation_id: &str, tool_id: &str, display_name: &str) {
        info!(conversation = %conversation_id, tool = %tool_id, name = %display_name, "tool call");
    }
}
