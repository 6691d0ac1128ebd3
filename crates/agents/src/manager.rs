//! Process-wide registry of container agents.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bollard::Docker;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::agent::{AgentOverrides, AgentState, AgentStats, ContainerAgent, ExecOutcome, ResourceLimits};
use crate::error::AgentError;

/// How often the background reaper scans for idle agents.
const REAP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct AgentManagerConfig {
    pub image: String,
    /// Base directory under which each conversation's workspace lives.
    pub working_dir_base: PathBuf,
    pub default_limits: ResourceLimits,
    /// Zero disables idle stopping.
    pub default_idle_deadline: Duration,
    pub max_agents: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub total_agents: usize,
    pub agents_by_state: HashMap<&'static str, usize>,
    pub total_commands: u64,
    pub agents: Vec<AgentStats>,
}

/// Registry mapping conversation id → agent, with admission control and a
/// periodic reaper. Registration never starts a container; that happens on
/// the first executed command.
pub struct AgentManager {
    docker: Docker,
    config: AgentManagerConfig,
    agents: Mutex<HashMap<String, Arc<ContainerAgent>>>,
}

impl AgentManager {
    pub fn new(config: AgentManagerConfig) -> Result<Arc<Self>, AgentError> {
        let docker = Docker::connect_with_local_defaults()?;
        std::fs::create_dir_all(&config.working_dir_base).map_err(|err| {
            AgentError::InitFailed {
                conversation_id: String::new(),
                reason: format!(
                    "cannot create working directory base {}: {err}",
                    config.working_dir_base.display()
                ),
            }
        })?;
        Ok(Arc::new(Self {
            docker,
            config,
            agents: Mutex::new(HashMap::new()),
        }))
    }

    /// Spawn the background reaper. Cooperative: agents with a command
    /// mid-flight are skipped and caught on a later scan.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let agents: Vec<Arc<ContainerAgent>> =
                    manager.agents.lock().await.values().cloned().collect();
                for agent in agents {
                    agent.reap_if_idle().await;
                }
            }
        })
    }

    /// Idempotent: repeated calls with the same id return the same agent.
    /// Only registers intent; the container starts on the first command.
    pub async fn get_or_create(
        &self,
        conversation_id: &str,
        overrides: AgentOverrides,
    ) -> Arc<ContainerAgent> {
        let mut agents = self.agents.lock().await;
        if let Some(agent) = agents.get(conversation_id) {
            return Arc::clone(agent);
        }

        if agents.len() >= self.config.max_agents {
            self.evict_oldest_stoppable(&mut agents).await;
        }

        let limits = ResourceLimits {
            memory_bytes: overrides
                .memory_bytes
                .unwrap_or(self.config.default_limits.memory_bytes),
            nano_cpus: overrides
                .nano_cpus
                .unwrap_or(self.config.default_limits.nano_cpus),
        };
        let idle_deadline = overrides
            .idle_deadline
            .unwrap_or(self.config.default_idle_deadline);

        let agent = Arc::new(ContainerAgent::new(
            conversation_id,
            self.docker.clone(),
            self.config.image.clone(),
            self.config.working_dir_base.join(conversation_id),
            limits,
            idle_deadline,
        ));
        agents.insert(conversation_id.to_string(), Arc::clone(&agent));
        info!(conversation = %conversation_id, "registered lazy agent");
        agent
    }

    /// Evict the oldest-activity agent in a stoppable state. Running agents
    /// are never evicted implicitly; with no candidate we admit anyway and
    /// let resource pressure degrade rather than denying service.
    async fn evict_oldest_stoppable(&self, agents: &mut HashMap<String, Arc<ContainerAgent>>) {
        let candidate = agents
            .iter()
            .filter(|(_, agent)| agent.state_nonblocking().is_stoppable())
            .min_by_key(|(_, agent)| agent.last_activity_nonblocking())
            .map(|(id, agent)| (id.clone(), Arc::clone(agent)));

        match candidate {
            Some((id, agent)) => {
                info!(conversation = %id, "evicting agent to admit a new conversation");
                agent.shutdown(true).await;
                agents.remove(&id);
            }
            None => {
                warn!(
                    max_agents = self.config.max_agents,
                    "no stoppable agent to evict; admitting over the limit"
                );
            }
        }
    }

    /// Convenience entry point: register if needed, then execute.
    pub async fn execute(
        &self,
        conversation_id: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecOutcome, AgentError> {
        let agent = self.get_or_create(conversation_id, AgentOverrides::default()).await;
        agent.execute(command, timeout).await
    }

    pub async fn get(&self, conversation_id: &str) -> Option<Arc<ContainerAgent>> {
        self.agents.lock().await.get(conversation_id).cloned()
    }

    /// Stop the conversation's container and drop its registry entry.
    pub async fn release_conversation(&self, conversation_id: &str, remove_data: bool) {
        let agent = self.agents.lock().await.remove(conversation_id);
        if let Some(agent) = agent {
            agent.shutdown(remove_data).await;
            info!(conversation = %conversation_id, remove_data, "released conversation agent");
        }
    }

    pub async fn stats(&self) -> ManagerStats {
        let agents: Vec<Arc<ContainerAgent>> =
            self.agents.lock().await.values().cloned().collect();

        let mut by_state: HashMap<&'static str, usize> = HashMap::new();
        for state in [
            AgentState::NotCreated,
            AgentState::Starting,
            AgentState::Running,
            AgentState::Idle,
            AgentState::Stopping,
            AgentState::Stopped,
            AgentState::Error,
        ] {
            by_state.insert(state.as_str(), 0);
        }

        let mut snapshots = Vec::with_capacity(agents.len());
        let mut total_commands = 0;
        for agent in agents {
            let stats = agent.stats().await;
            *by_state.entry(stats.state).or_insert(0) += 1;
            total_commands += stats.command_count;
            snapshots.push(stats);
        }

        ManagerStats {
            total_agents: snapshots.len(),
            agents_by_state: by_state,
            total_commands,
            agents: snapshots,
        }
    }

    /// Stop every container. Called at process shutdown.
    pub async fn shutdown_all(&self, remove_data: bool) {
        let mut agents = self.agents.lock().await;
        for (id, agent) in agents.drain() {
            agent.shutdown(remove_data).await;
            info!(conversation = %id, "agent shut down");
        }
    }
}
