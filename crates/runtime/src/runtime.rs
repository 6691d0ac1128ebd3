//! Process-owned runtime: conversations, tools, agents, and the driver.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use dockhand_agents::{AgentManager, AgentManagerConfig, ManagerStats, ResourceLimits};
use dockhand_config::AppConfig;
use dockhand_llm::{Message, ModelApi};
use dockhand_tools::builtins::{BashToolProvider, FileSystemProvider, ViewPhotoProvider};
use dockhand_tools::{Overlay, ToolRegistry, ToolReply, TracingSink};

use crate::driver::{DriverConfig, ToolRoute, TurnDriver};
use crate::layout::RuntimeLayout;

/// One conversation's history and workspace. Turns serialize on the
/// conversation's own lock; distinct conversations run in parallel.
#[derive(Debug)]
pub struct Conversation {
    pub id: String,
    pub history: Vec<Message>,
    pub workspace: PathBuf,
}

#[derive(Debug)]
pub struct RuntimeStats {
    pub conversations: Vec<String>,
    pub agents: ManagerStats,
}

/// Everything the ingress needs, owned by one object; no module-level
/// state. Construct inside a tokio runtime (the reaper task spawns here).
pub struct Runtime {
    config: AppConfig,
    layout: RuntimeLayout,
    registry: Arc<ToolRegistry>,
    agents: Arc<AgentManager>,
    driver: TurnDriver<dyn ModelApi>,
    conversations: Mutex<HashMap<String, Arc<Mutex<Conversation>>>>,
    reaper: JoinHandle<()>,
}

impl Runtime {
    pub fn new(config: AppConfig, api: Arc<dyn ModelApi>) -> Result<Self> {
        let layout = RuntimeLayout::new(&config.runtime.runtime_dir)?;

        let agents = AgentManager::new(AgentManagerConfig {
            image: config.sandbox.image.clone(),
            working_dir_base: layout.working_dir_base(),
            default_limits: ResourceLimits {
                memory_bytes: config.sandbox.memory_bytes()?,
                nano_cpus: config.sandbox.nano_cpus(),
            },
            default_idle_deadline: config.sandbox.idle_deadline(),
            max_agents: config.sandbox.max_agents,
        })
        .context("agent manager startup failed")?;
        let reaper = agents.spawn_reaper();

        let mut registry = ToolRegistry::new(Arc::new(TracingSink))
            .with_overlay(Overlay::new(config.overlay.command.clone()));
        registry
            .register(Arc::new(BashToolProvider::new(
                Arc::clone(&agents),
                config.sandbox.command_timeout_secs,
            )))
            .context("registering bash tools")?;
        registry
            .register(Arc::new(FileSystemProvider))
            .context("registering file tools")?;
        registry
            .register(Arc::new(ViewPhotoProvider))
            .context("registering photo tool")?;

        let driver = TurnDriver::new(
            api,
            DriverConfig {
                primary_model: config.llm.model.clone(),
                backup_model: config.llm.backup_model.clone(),
                max_tokens: config.llm.max_tokens,
                system_prompt: (!config.llm.system_prompt.is_empty())
                    .then(|| config.llm.system_prompt.clone()),
                builtin_tools: config.llm.builtin_tools.clone(),
                retry: config.retry.clone(),
            },
        );

        info!(
            runtime_dir = %layout.root().display(),
            tools = ?registry.list_tools(),
            "runtime initialized"
        );

        Ok(Self {
            config,
            layout,
            registry: Arc::new(registry),
            agents,
            driver,
            conversations: Mutex::new(HashMap::new()),
            reaper,
        })
    }

    pub fn layout(&self) -> &RuntimeLayout {
        &self.layout
    }

    /// Stable id for a fresh conversation when the ingress has none.
    pub fn generate_conversation_id() -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("conv-{}", &suffix[..8])
    }

    async fn get_or_create(&self, conversation_id: &str) -> Result<Arc<Mutex<Conversation>>> {
        let mut conversations = self.conversations.lock().await;
        if let Some(conversation) = conversations.get(conversation_id) {
            return Ok(Arc::clone(conversation));
        }

        let dirs = self.layout.setup_conversation(conversation_id)?;
        info!(conversation = %conversation_id, "created conversation");
        let conversation = Arc::new(Mutex::new(Conversation {
            id: conversation_id.to_string(),
            history: Vec::new(),
            workspace: dirs.working_dir,
        }));
        conversations.insert(conversation_id.to_string(), Arc::clone(&conversation));
        Ok(conversation)
    }

    /// Run one user turn and return the assistant's reply text.
    pub async fn handle_prompt(&self, conversation_id: &str, prompt: &str) -> Result<String> {
        let conversation = self.get_or_create(conversation_id).await?;
        let mut conversation = conversation.lock().await;

        let route = ConversationRoute {
            registry: Arc::clone(&self.registry),
            conversation_id: conversation.id.clone(),
            workspace: conversation.workspace.clone(),
        };

        let outcome = self
            .driver
            .run_turn(
                &conversation.history,
                prompt,
                self.registry.wire_catalog(),
                &route,
            )
            .await
            .map_err(|err| anyhow::anyhow!("model call failed: {err}"))?;

        conversation.history = outcome.history;
        Ok(outcome.reply)
    }

    pub async fn conversation_history(&self, conversation_id: &str) -> Option<Vec<Message>> {
        let conversation = self.conversations.lock().await.get(conversation_id).cloned()?;
        let conversation = conversation.lock().await;
        Some(conversation.history.clone())
    }

    /// Destroy a conversation: history, provider state, container, and
    /// directories.
    pub async fn reset_conversation(&self, conversation_id: &str) -> Result<()> {
        self.conversations.lock().await.remove(conversation_id);
        self.registry.clear_conversation_state(conversation_id).await;
        self.agents.release_conversation(conversation_id, true).await;
        self.layout.remove_conversation(conversation_id)?;
        info!(conversation = %conversation_id, "conversation reset");
        Ok(())
    }

    pub async fn stats(&self) -> RuntimeStats {
        let mut conversations: Vec<String> =
            self.conversations.lock().await.keys().cloned().collect();
        conversations.sort();
        RuntimeStats {
            conversations,
            agents: self.agents.stats().await,
        }
    }

    /// Stop all containers and the reaper. Workspace removal follows the
    /// configured shutdown policy.
    pub async fn shutdown(&self) {
        self.reaper.abort();
        self.agents
            .shutdown_all(self.config.runtime.remove_data_on_shutdown)
            .await;
        info!("runtime shut down");
    }
}

/// Per-conversation adapter handing driver tool calls to the dispatcher.
struct ConversationRoute {
    registry: Arc<ToolRegistry>,
    conversation_id: String,
    workspace: PathBuf,
}

#[async_trait]
impl ToolRoute for ConversationRoute {
    async fn call(&self, tool_id: &str, input: &Value) -> Result<ToolReply, String> {
        self.registry
            .dispatch(tool_id, input, &self.conversation_id, &self.workspace)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use dockhand_llm::{CompletionRequest, ContentBlock, LlmError};

    /// Minimal scripted model: always requests `list_files`, then answers.
    struct ListThenAnswer;

    #[async_trait]
    impl ModelApi for ListThenAnswer {
        async fn complete(
            &self,
            request: &CompletionRequest,
        ) -> Result<Vec<ContentBlock>, LlmError> {
            // Second round: the last message carries tool results.
            let has_tool_results = request
                .messages
                .last()
                .and_then(|m| m.get("content"))
                .and_then(Value::as_array)
                .map(|blocks| {
                    blocks
                        .iter()
                        .any(|b| b.get("type") == Some(&json!("tool_result")))
                })
                .unwrap_or(false);

            if has_tool_results {
                Ok(vec![ContentBlock::text("the workspace is empty")])
            } else {
                Ok(vec![ContentBlock::ToolUse {
                    id: "toolu_ls".to_string(),
                    name: "list_files".to_string(),
                    input: json!({"directory": "."}),
                }])
            }
        }
    }

    fn test_config(dir: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.runtime.runtime_dir = dir.join("runtime").display().to_string();
        config
    }

    #[tokio::test]
    async fn prompt_runs_tools_against_the_conversation_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Runtime::new(test_config(dir.path()), Arc::new(ListThenAnswer)).unwrap();

        let reply = runtime.handle_prompt("conv-1", "what's here?").await.unwrap();
        assert_eq!(reply, "the workspace is empty");

        // The turn left a four-message history: user, assistant(tool_use),
        // user(tool_result), assistant.
        let history = runtime.conversation_history("conv-1").await.unwrap();
        assert_eq!(history.len(), 4);

        // The workspace (with temp/ and symlinks) exists on disk.
        let workspace = runtime.layout().working_dir("conv-1");
        assert!(workspace.join("temp").is_dir());

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn reset_clears_history_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Runtime::new(test_config(dir.path()), Arc::new(ListThenAnswer)).unwrap();

        runtime.handle_prompt("conv-1", "hello").await.unwrap();
        assert!(runtime.conversation_history("conv-1").await.is_some());

        runtime.reset_conversation("conv-1").await.unwrap();
        assert!(runtime.conversation_history("conv-1").await.is_none());
        assert!(!runtime.layout().working_dir("conv-1").exists());

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn stats_reports_conversations() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Runtime::new(test_config(dir.path()), Arc::new(ListThenAnswer)).unwrap();

        runtime.handle_prompt("conv-b", "hi").await.unwrap();
        runtime.handle_prompt("conv-a", "hi").await.unwrap();

        let stats = runtime.stats().await;
        assert_eq!(stats.conversations, vec!["conv-a", "conv-b"]);

        runtime.shutdown().await;
    }

    #[test]
    fn generated_conversation_ids_are_unique() {
        let a = Runtime::generate_conversation_id();
        let b = Runtime::generate_conversation_id();
        assert_ne!(a, b);
        assert!(a.starts_with("conv-"));
    }
}
