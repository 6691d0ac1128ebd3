//! Shell execution in the conversation's sandbox container.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;

use dockhand_agents::{AgentError, AgentManager};

use crate::registry::{ProviderInit, StateMap, ToolCallState, ToolProvider, ToolReply};
use crate::schema::{Param, ParamKind, ToolDescriptor};

/// Exit code reported for a timed-out command, matching coreutils `timeout`.
const TIMEOUT_EXIT_CODE: i64 = 124;

/// Routes `bash` / `bash_status` / `bash_reset` through the agent manager.
pub struct BashToolProvider {
    manager: Arc<AgentManager>,
    default_timeout_secs: u64,
}

impl BashToolProvider {
    pub fn new(manager: Arc<AgentManager>, default_timeout_secs: u64) -> Self {
        Self {
            manager,
            default_timeout_secs,
        }
    }

    async fn execute_bash(
        &self,
        args: &Value,
        state: &ToolCallState,
    ) -> Result<ToolReply, String> {
        let command = args
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| "Command parameter is required".to_string())?;
        let timeout_secs = args
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(self.default_timeout_secs);
        let timeout = (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs));

        let conversation_id = state.conversation_id().await;
        let is_first = {
            let store = state.conversation.lock().await;
            !store
                .get("container_created")
                .and_then(Value::as_bool)
                .unwrap_or(false)
        };

        let outcome = match self.manager.execute(&conversation_id, command, timeout).await {
            Ok(outcome) => outcome,
            Err(AgentError::CommandTimeout(bound)) => {
                // Structured result rather than an error: the model should
                // see the timeout and adapt, and the container survives.
                return Ok(ToolReply::Json(json!({
                    "exit_code": TIMEOUT_EXIT_CODE,
                    "stdout": "",
                    "stderr": format!("Command timed out after {}s", bound.as_secs()),
                    "success": false,
                    "timed_out": true,
                    "command": command,
                    "conversation_id": conversation_id,
                })));
            }
            Err(err) => return Err(format!("Error executing bash: {err}")),
        };

        let command_number = {
            let mut store = state.conversation.lock().await;
            let count = store
                .get("command_count")
                .and_then(Value::as_u64)
                .unwrap_or(0)
                + 1;
            store.insert("command_count".to_string(), json!(count));
            store.insert("container_created".to_string(), json!(true));
            store.insert(
                "last_command_time".to_string(),
                json!(chrono_now_iso()),
            );
            count
        };
        {
            let mut global = state.global.lock().await;
            bump(&mut global, "total_commands");
            if is_first {
                bump(&mut global, "total_containers");
                info!(conversation = %conversation_id, "container created (lazy init)");
            }
        }

        let success = outcome.exit_code == 0;
        let output = if success {
            outcome.stdout.clone()
        } else if outcome.stderr.is_empty() {
            outcome.stdout.clone()
        } else {
            outcome.stderr.clone()
        };
        Ok(ToolReply::Json(json!({
            "exit_code": outcome.exit_code,
            "stdout": outcome.stdout,
            "stderr": outcome.stderr,
            "success": success,
            "command": command,
            "output": output,
            "conversation_id": conversation_id,
            "command_number": command_number,
            "container_was_created": is_first,
        })))
    }

    async fn status(&self, state: &ToolCallState) -> Result<ToolReply, String> {
        let conversation_id = state.conversation_id().await;
        match self.manager.get(&conversation_id).await {
            Some(agent) => {
                let stats = agent.stats().await;
                Ok(ToolReply::Json(json!({
                    "conversation_id": conversation_id,
                    "container_state": stats.state,
                    "container_active": stats.state == "running",
                    "command_count": stats.command_count,
                    "last_activity": stats.last_activity,
                    "uptime_seconds": stats.uptime_seconds,
                    "idle_seconds": stats.idle_seconds,
                    "work_dir": stats.workspace,
                })))
            }
            None => Ok(ToolReply::Json(json!({
                "conversation_id": conversation_id,
                "container_state": "not_created",
                "container_active": false,
                "command_count": 0,
                "message": "No container created yet (will be created on first bash command)",
            }))),
        }
    }

    async fn reset(&self, args: &Value, state: &ToolCallState) -> Result<ToolReply, String> {
        let keep_data = args.get("keep_data").and_then(Value::as_bool).unwrap_or(false);
        let conversation_id = state.conversation_id().await;

        let had_agent = self.manager.get(&conversation_id).await.is_some();
        if had_agent {
            self.manager
                .release_conversation(&conversation_id, !keep_data)
                .await;
            let mut store = state.conversation.lock().await;
            store.insert("container_created".to_string(), json!(false));
            store.insert("command_count".to_string(), json!(0));
            store.insert("last_command_time".to_string(), Value::Null);
        }

        Ok(ToolReply::Json(json!({
            "status": if had_agent { "reset" } else { "no_container" },
            "conversation_id": conversation_id,
            "data_kept": keep_data,
            "message": if had_agent {
                "Container stopped and removed. A new container will be created on the next bash command."
            } else {
                "No container to reset"
            },
        })))
    }
}

#[async_trait]
impl ToolProvider for BashToolProvider {
    fn init(&self) -> Result<ProviderInit> {
        let tools = vec![
            ToolDescriptor::new(
                "bash",
                "Bash Command Execution",
                "Execute bash commands in a stateful Linux environment. Each conversation has \
                 its own persistent container with a writable /mnt directory. The shell keeps \
                 state across commands (working directory, environment variables, aliases), \
                 so `cd` is remembered between calls.",
            )
            .with_param("command", Param::required(ParamKind::String, "Bash command to execute"))
            .with_param(
                "timeout",
                Param::optional(
                    ParamKind::Integer,
                    "Command timeout in seconds (0 disables the timeout)",
                )
                .with_default(json!(self.default_timeout_secs)),
            ),
            ToolDescriptor::new(
                "bash_status",
                "Bash Environment Status",
                "Get status of the bash environment for this conversation",
            ),
            ToolDescriptor::new(
                "bash_reset",
                "Reset Bash Environment",
                "Reset the bash environment (stops and removes the container)",
            )
            .with_param(
                "keep_data",
                Param::optional(ParamKind::Boolean, "Keep the /mnt data after reset")
                    .with_default(json!(false)),
            ),
        ];

        Ok(ProviderInit {
            tools,
            global_state: StateMap::from([
                ("total_commands".to_string(), json!(0)),
                ("total_containers".to_string(), json!(0)),
            ]),
            conversation_template: StateMap::from([
                ("container_created".to_string(), json!(false)),
                ("command_count".to_string(), json!(0)),
                ("last_command_time".to_string(), Value::Null),
                ("working_directory".to_string(), json!("/mnt")),
            ]),
        })
    }

    async fn call(
        &self,
        tool_id: &str,
        args: &Value,
        state: ToolCallState,
    ) -> Result<ToolReply, String> {
        match tool_id {
            "bash" => self.execute_bash(args, &state).await,
            "bash_status" => self.status(&state).await,
            "bash_reset" => self.reset(args, &state).await,
            other => Err(format!("Unknown tool: {other}")),
        }
    }
}

fn bump(store: &mut StateMap, key: &str) {
    let value = store.get(key).and_then(Value::as_i64).unwrap_or(0);
    store.insert(key.to_string(), json!(value + 1));
}

fn chrono_now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}
