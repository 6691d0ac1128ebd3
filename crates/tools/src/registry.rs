//! Tool registration and dispatch.
//!
//! Providers register at startup from an explicit list; at runtime the set
//! is fixed. Every inbound call is validated against the declared schema
//! before a provider ever sees it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::debug;

use crate::events::EventSink;
use crate::overlay::Overlay;
use crate::schema::ToolDescriptor;
use crate::validate::validate_call;

/// Reserved keys the dispatcher stamps into every conversation store before
/// each call.
pub const CONVERSATION_ID_KEY: &str = "_conversation_id";
pub const WORKING_DIRECTORY_KEY: &str = "_working_directory";

pub type StateMap = HashMap<String, Value>;

/// What a provider hands back on success: a JSON-able value, or a tagged
/// image for the model's vision input.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolReply {
    Json(Value),
    Image {
        media_type: String,
        data: String,
        name: String,
    },
}

/// Provider-visible state for one call. Each store sits behind its own lock
/// so distinct conversations dispatch in parallel; the global store is the
/// only structure shared across conversations.
#[derive(Clone)]
pub struct ToolCallState {
    pub conversation: Arc<Mutex<StateMap>>,
    pub global: Arc<Mutex<StateMap>>,
}

impl ToolCallState {
    pub async fn conversation_id(&self) -> String {
        self.conversation
            .lock()
            .await
            .get(CONVERSATION_ID_KEY)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    pub async fn working_directory(&self) -> Option<PathBuf> {
        self.conversation
            .lock()
            .await
            .get(WORKING_DIRECTORY_KEY)
            .and_then(Value::as_str)
            .map(PathBuf::from)
    }
}

/// Declared surface of one provider.
pub struct ProviderInit {
    pub tools: Vec<ToolDescriptor>,
    pub global_state: StateMap,
    pub conversation_template: StateMap,
}

/// A set of tools plus the state they share. `init` runs once at
/// registration; `call` only ever receives a tool id this provider declared
/// and arguments the validator accepted.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    fn init(&self) -> Result<ProviderInit>;

    async fn call(
        &self,
        tool_id: &str,
        args: &Value,
        state: ToolCallState,
    ) -> Result<ToolReply, String>;
}

struct ProviderEntry {
    provider: Arc<dyn ToolProvider>,
    global: Arc<Mutex<StateMap>>,
    template: StateMap,
    conversations: Mutex<HashMap<String, Arc<Mutex<StateMap>>>>,
}

/// The registered tool set and its dispatcher.
pub struct ToolRegistry {
    providers: Vec<ProviderEntry>,
    /// tool id → (provider index, descriptor); ids are globally unique.
    tools: HashMap<String, (usize, ToolDescriptor)>,
    /// Registration order, for a stable catalog.
    order: Vec<String>,
    sink: Arc<dyn EventSink>,
    overlay: Option<Arc<Overlay>>,
}

impl ToolRegistry {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            providers: Vec::new(),
            tools: HashMap::new(),
            order: Vec::new(),
            sink,
            overlay: None,
        }
    }

    pub fn with_overlay(mut self, overlay: Option<Arc<Overlay>>) -> Self {
        self.overlay = overlay;
        self
    }

    /// Register a provider and all of its tools. A duplicate tool id is a
    /// fatal configuration error.
    pub fn register(&mut self, provider: Arc<dyn ToolProvider>) -> Result<()> {
        let init = provider.init()?;
        let index = self.providers.len();

        for tool in &init.tools {
            if self.tools.contains_key(&tool.id) {
                bail!("tool with id `{}` already registered", tool.id);
            }
        }
        for tool in init.tools {
            self.order.push(tool.id.clone());
            self.tools.insert(tool.id.clone(), (index, tool));
        }

        self.providers.push(ProviderEntry {
            provider,
            global: Arc::new(Mutex::new(init.global_state)),
            template: init.conversation_template,
            conversations: Mutex::new(HashMap::new()),
        });
        Ok(())
    }

    /// All tools in the endpoint's catalog schema, registration order.
    pub fn wire_catalog(&self) -> Vec<Value> {
        self.order
            .iter()
            .filter_map(|id| self.tools.get(id))
            .map(|(_, tool)| tool.to_wire())
            .collect()
    }

    pub fn descriptor(&self, tool_id: &str) -> Option<&ToolDescriptor> {
        self.tools.get(tool_id).map(|(_, tool)| tool)
    }

    pub fn list_tools(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }

    /// Validate and route one tool call. The error string (schema violation,
    /// sandbox refusal, provider failure) becomes an error tool_result.
    pub async fn dispatch(
        &self,
        tool_id: &str,
        args: &Value,
        conversation_id: &str,
        working_directory: &Path,
    ) -> Result<ToolReply, String> {
        let Some((provider_index, tool)) = self.tools.get(tool_id) else {
            return Err(format!("Error: Unknown tool `{tool_id}`"));
        };

        if let Some(error) = validate_call(tool, args) {
            return Err(error);
        }

        // Best-effort observability; a sink failure must never fail the call.
        self.sink.tool_called(conversation_id, tool_id, &tool.name);

        let entry = &self.providers[*provider_index];
        let conversation = {
            let mut conversations = entry.conversations.lock().await;
            let store = conversations
                .entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(entry.template.clone())));
            Arc::clone(store)
        };
        {
            let mut store = conversation.lock().await;
            store.insert(CONVERSATION_ID_KEY.to_string(), json!(conversation_id));
            store.insert(
                WORKING_DIRECTORY_KEY.to_string(),
                json!(working_directory.display().to_string()),
            );
        }

        let _overlay_guard = self.overlay.as_ref().map(|overlay| overlay.arm());

        debug!(conversation = %conversation_id, tool = %tool_id, "dispatching tool call");
        entry
            .provider
            .call(
                tool_id,
                args,
                ToolCallState {
                    conversation,
                    global: Arc::clone(&entry.global),
                },
            )
            .await
    }

    /// Drop a conversation's state across all providers.
    pub async fn clear_conversation_state(&self, conversation_id: &str) {
        for entry in &self.providers {
            entry.conversations.lock().await.remove(conversation_id);
        }
    }
}
