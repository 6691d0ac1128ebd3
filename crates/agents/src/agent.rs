//! One sandbox container for one conversation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{ContainerStateStatusEnum, HostConfig, ResourcesUlimits};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use dockhand_shell::{StatefulShell, clean_stderr};

use crate::error::AgentError;

/// How long the creating call polls the daemon for the container to report
/// Running before giving up.
const STARTUP_WINDOW: Duration = Duration::from_secs(60);
const STARTUP_POLL: Duration = Duration::from_millis(100);
/// Grace given to `docker stop` before the daemon kills the process.
const STOP_GRACE_SECS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    NotCreated,
    Starting,
    Running,
    Idle,
    Stopping,
    Stopped,
    Error,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotCreated => "not_created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    /// States eligible for implicit eviction. A Running agent is never
    /// evicted behind the conversation's back.
    pub fn is_stoppable(&self) -> bool {
        matches!(self, Self::NotCreated | Self::Stopped)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub memory_bytes: i64,
    pub nano_cpus: i64,
}

/// Per-conversation overrides applied at registration time.
#[derive(Debug, Clone, Copy, Default)]
pub struct AgentOverrides {
    pub memory_bytes: Option<i64>,
    pub nano_cpus: Option<i64>,
    pub idle_deadline: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentStats {
    pub conversation_id: String,
    pub state: &'static str,
    pub command_count: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    pub uptime_seconds: Option<i64>,
    pub idle_seconds: i64,
    pub workspace: String,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub idle_deadline_secs: u64,
}

#[derive(Debug)]
struct AgentInner {
    state: AgentState,
    container_id: Option<String>,
    shell: StatefulShell,
    command_count: u64,
    created_at: Option<DateTime<Utc>>,
    last_activity: DateTime<Utc>,
    idle_task: Option<JoinHandle<()>>,
}

/// Owns one container for one conversation for its lifetime.
///
/// All mutation happens under the inner lock, which also serializes command
/// execution for the conversation: concurrent first commands queue on the
/// lock instead of racing to create duplicate containers.
pub struct ContainerAgent {
    conversation_id: String,
    container_name: String,
    image: String,
    workspace: PathBuf,
    limits: ResourceLimits,
    idle_deadline: Duration,
    docker: Docker,
    inner: Mutex<AgentInner>,
}

impl std::fmt::Debug for ContainerAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerAgent")
            .field("conversation_id", &self.conversation_id)
            .field("container_name", &self.container_name)
            .field("workspace", &self.workspace)
            .finish_non_exhaustive()
    }
}

impl ContainerAgent {
    pub fn new(
        conversation_id: impl Into<String>,
        docker: Docker,
        image: impl Into<String>,
        workspace: PathBuf,
        limits: ResourceLimits,
        idle_deadline: Duration,
    ) -> Self {
        let conversation_id = conversation_id.into();
        Self {
            container_name: format!("dockhand-agent-{conversation_id}"),
            conversation_id,
            image: image.into(),
            workspace,
            limits,
            idle_deadline,
            docker,
            inner: Mutex::new(AgentInner {
                state: AgentState::NotCreated,
                container_id: None,
                shell: StatefulShell::new(),
                command_count: 0,
                created_at: None,
                last_activity: Utc::now(),
                idle_task: None,
            }),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn idle_deadline(&self) -> Duration {
        self.idle_deadline
    }

    /// Execute one command, lazily creating the container on first use.
    pub async fn execute(
        self: &Arc<Self>,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecOutcome, AgentError> {
        // Whitespace carries no work; don't spin up a container for it.
        if command.trim().is_empty() {
            return Ok(ExecOutcome {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            });
        }

        let mut inner = self.inner.lock().await;
        self.ensure_running(&mut inner).await?;

        inner.last_activity = Utc::now();
        inner.command_count += 1;

        let script = inner.shell.build_command(command);
        let container_id = inner
            .container_id
            .clone()
            .ok_or_else(|| AgentError::ContainerLost(self.conversation_id.clone()))?;

        let result = self.run_exec(&container_id, &script, timeout).await;
        match result {
            Ok((exit_code, raw_stdout, raw_stderr)) => {
                let stdout = inner.shell.absorb_output(&raw_stdout);
                let stderr = clean_stderr(&raw_stderr);
                self.arm_idle_timer(&mut inner);
                debug!(
                    conversation = %self.conversation_id,
                    exit_code,
                    commands = inner.command_count,
                    "command completed"
                );
                Ok(ExecOutcome {
                    exit_code,
                    stdout,
                    stderr,
                })
            }
            Err(AgentError::CommandTimeout(bound)) => {
                // The container and the recorded shell state survive; only
                // this command's state dump is lost.
                self.arm_idle_timer(&mut inner);
                Err(AgentError::CommandTimeout(bound))
            }
            Err(err) => {
                warn!(conversation = %self.conversation_id, %err, "exec failed; marking agent errored");
                inner.state = AgentState::Error;
                Err(AgentError::ContainerLost(self.conversation_id.clone()))
            }
        }
    }

    /// Bring the container to Running, creating it if needed. Called with the
    /// inner lock held, which is what serializes concurrent first commands.
    async fn ensure_running(self: &Arc<Self>, inner: &mut AgentInner) -> Result<(), AgentError> {
        match inner.state {
            AgentState::Running => Ok(()),
            AgentState::NotCreated | AgentState::Stopped => self.create_container(inner).await,
            AgentState::Error => {
                // Self-heal: discard whatever remains and start fresh.
                self.remove_remnant(inner).await;
                self.create_container(inner).await
            }
            AgentState::Starting | AgentState::Idle | AgentState::Stopping => {
                // Transitional states are only held under the lock; seeing
                // one here means a previous transition was interrupted.
                self.remove_remnant(inner).await;
                self.create_container(inner).await
            }
        }
    }

    async fn create_container(self: &Arc<Self>, inner: &mut AgentInner) -> Result<(), AgentError> {
        inner.state = AgentState::Starting;
        info!(conversation = %self.conversation_id, image = %self.image, "lazy-initializing container");

        if let Err(err) = std::fs::create_dir_all(&self.workspace) {
            inner.state = AgentState::Error;
            return Err(AgentError::InitFailed {
                conversation_id: self.conversation_id.clone(),
                reason: format!("cannot create workspace: {err}"),
            });
        }

        if let Err(err) = self.docker.inspect_image(&self.image).await {
            inner.state = AgentState::Error;
            return Err(match err {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => AgentError::ImageMissing(self.image.clone()),
                other => AgentError::InitFailed {
                    conversation_id: self.conversation_id.clone(),
                    reason: format!("image inspect failed: {other}"),
                },
            });
        }

        let config = self.container_config();
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: self.container_name.clone(),
                    platform: None,
                }),
                config,
            )
            .await;

        let container_id = match created {
            Ok(response) => response.id,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => {
                // Remnant from a previous run with the same name; replace it.
                self.remove_remnant(inner).await;
                self.docker
                    .create_container(
                        Some(CreateContainerOptions {
                            name: self.container_name.clone(),
                            platform: None,
                        }),
                        self.container_config(),
                    )
                    .await
                    .map_err(|err| {
                        inner.state = AgentState::Error;
                        AgentError::InitFailed {
                            conversation_id: self.conversation_id.clone(),
                            reason: format!("container create failed: {err}"),
                        }
                    })?
                    .id
            }
            Err(err) => {
                inner.state = AgentState::Error;
                return Err(AgentError::InitFailed {
                    conversation_id: self.conversation_id.clone(),
                    reason: format!("container create failed: {err}"),
                });
            }
        };

        if let Err(err) = self
            .docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
        {
            inner.state = AgentState::Error;
            return Err(AgentError::InitFailed {
                conversation_id: self.conversation_id.clone(),
                reason: format!("container start failed: {err}"),
            });
        }

        // Poll until the daemon reports Running, bounded by the startup window.
        let deadline = tokio::time::Instant::now() + STARTUP_WINDOW;
        loop {
            let state = self
                .docker
                .inspect_container(&container_id, None::<InspectContainerOptions>)
                .await
                .ok()
                .and_then(|c| c.state)
                .and_then(|s| s.status);
            if state == Some(ContainerStateStatusEnum::RUNNING) {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                inner.state = AgentState::Error;
                return Err(AgentError::InitFailed {
                    conversation_id: self.conversation_id.clone(),
                    reason: format!("container not running within {}s", STARTUP_WINDOW.as_secs()),
                });
            }
            tokio::time::sleep(STARTUP_POLL).await;
        }

        inner.container_id = Some(container_id);
        inner.state = AgentState::Running;
        inner.created_at = Some(Utc::now());
        inner.last_activity = Utc::now();
        // Fresh container, fresh shell.
        inner.shell.reset();
        self.arm_idle_timer(inner);
        info!(conversation = %self.conversation_id, "container ready");
        Ok(())
    }

    fn container_config(&self) -> Config<String> {
        let mut tmpfs = HashMap::new();
        tmpfs.insert("/tmp".to_string(), "rw,noexec,nosuid,size=100m".to_string());
        tmpfs.insert("/var/tmp".to_string(), "rw,noexec,nosuid,size=100m".to_string());
        tmpfs.insert(
            "/home/agent/.cache".to_string(),
            "rw,noexec,nosuid,size=50m".to_string(),
        );

        Config {
            image: Some(self.image.clone()),
            // Hold-open command so the container persists between execs.
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            env: Some(vec![
                format!("AGENT_ID={}", self.conversation_id),
                "AGENT_WORK_DIR=/mnt".to_string(),
            ]),
            tty: Some(true),
            open_stdin: Some(true),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{}:/mnt:rw", self.workspace.display())]),
                // Trusted-operator assumption; the single knob to change for
                // stronger isolation.
                network_mode: Some("host".to_string()),
                memory: Some(self.limits.memory_bytes),
                nano_cpus: Some(self.limits.nano_cpus),
                readonly_rootfs: Some(true),
                tmpfs: Some(tmpfs),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                cap_drop: Some(vec!["ALL".to_string()]),
                cap_add: Some(
                    ["CHOWN", "DAC_OVERRIDE", "SETGID", "SETUID", "NET_RAW", "NET_BIND_SERVICE"]
                        .iter()
                        .map(ToString::to_string)
                        .collect(),
                ),
                ulimits: Some(vec![
                    ResourcesUlimits {
                        name: Some("nofile".to_string()),
                        soft: Some(1024),
                        hard: Some(2048),
                    },
                    ResourcesUlimits {
                        name: Some("nproc".to_string()),
                        soft: Some(512),
                        hard: Some(1024),
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn run_exec(
        &self,
        container_id: &str,
        script: &str,
        timeout: Option<Duration>,
    ) -> Result<(i64, String, String), AgentError> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(vec!["bash".to_string(), "-c".to_string(), script.to_string()]),
                    user: Some("agent".to_string()),
                    env: Some(vec![
                        format!("AGENT_ID={}", self.conversation_id),
                        "HOME=/home/agent".to_string(),
                        "USER=agent".to_string(),
                    ]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let collect = async {
            let mut stdout = String::new();
            let mut stderr = String::new();
            match self.docker.start_exec(&exec.id, None).await? {
                StartExecResults::Attached { mut output, .. } => {
                    while let Some(item) = output.next().await {
                        match item? {
                            LogOutput::StdOut { message } | LogOutput::Console { message } => {
                                stdout.push_str(&String::from_utf8_lossy(&message));
                            }
                            LogOutput::StdErr { message } => {
                                stderr.push_str(&String::from_utf8_lossy(&message));
                            }
                            LogOutput::StdIn { .. } => {}
                        }
                    }
                }
                StartExecResults::Detached => {}
            }
            let inspect = self.docker.inspect_exec(&exec.id).await?;
            Ok::<_, AgentError>((inspect.exit_code.unwrap_or(-1), stdout, stderr))
        };

        match timeout {
            Some(bound) => tokio::time::timeout(bound, collect)
                .await
                .map_err(|_| AgentError::CommandTimeout(bound))?,
            None => collect.await,
        }
    }

    /// Re-arm the per-agent idle timer. A zero deadline disables stopping.
    fn arm_idle_timer(self: &Arc<Self>, inner: &mut AgentInner) {
        if let Some(task) = inner.idle_task.take() {
            task.abort();
        }
        if self.idle_deadline.is_zero() {
            return;
        }
        let agent = Arc::clone(self);
        inner.idle_task = Some(tokio::spawn(async move {
            // Small slack so a fire at exactly the deadline cannot lose the
            // idle comparison; the manager's periodic reaper backstops it.
            tokio::time::sleep(agent.idle_deadline + Duration::from_millis(100)).await;
            agent.reap_if_idle().await;
        }));
    }

    /// Stop the container if it has been idle past its deadline. Cooperative:
    /// a command mid-flight holds the lock, so `try_lock` failing means the
    /// agent is busy and there is nothing to reap.
    pub async fn reap_if_idle(&self) {
        let Ok(mut inner) = self.inner.try_lock() else {
            return;
        };
        if inner.state != AgentState::Running || self.idle_deadline.is_zero() {
            return;
        }
        let idle = Utc::now() - inner.last_activity;
        if idle.to_std().unwrap_or_default() >= self.idle_deadline {
            info!(
                conversation = %self.conversation_id,
                idle_secs = idle.num_seconds(),
                "idle deadline reached; stopping container"
            );
            inner.state = AgentState::Idle;
            self.stop_locked(&mut inner).await;
        }
    }

    /// Stop and remove the container, keeping the workspace.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        self.stop_locked(&mut inner).await;
    }

    async fn stop_locked(&self, inner: &mut AgentInner) {
        if let Some(task) = inner.idle_task.take() {
            task.abort();
        }
        let Some(container_id) = inner.container_id.take() else {
            if inner.state != AgentState::Error {
                inner.state = AgentState::Stopped;
            }
            return;
        };
        inner.state = AgentState::Stopping;
        if let Err(err) = self
            .docker
            .stop_container(&container_id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
        {
            warn!(conversation = %self.conversation_id, %err, "container stop failed");
        }
        if let Err(err) = self
            .docker
            .remove_container(
                &container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            warn!(conversation = %self.conversation_id, %err, "container remove failed");
        }
        inner.state = AgentState::Stopped;
        info!(conversation = %self.conversation_id, "container stopped");
    }

    /// Remove any container remnant without touching recorded state.
    async fn remove_remnant(&self, inner: &mut AgentInner) {
        let target = inner
            .container_id
            .take()
            .unwrap_or_else(|| self.container_name.clone());
        match self
            .docker
            .remove_container(
                &target,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => {}
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(err) => warn!(conversation = %self.conversation_id, %err, "remnant cleanup failed"),
        }
    }

    /// Idempotent stop-and-remove; optionally deletes the workspace.
    pub async fn shutdown(&self, remove_data: bool) {
        let mut inner = self.inner.lock().await;
        self.stop_locked(&mut inner).await;
        if remove_data && self.workspace.exists() {
            if let Err(err) = std::fs::remove_dir_all(&self.workspace) {
                warn!(conversation = %self.conversation_id, %err, "workspace removal failed");
            }
        }
    }

    pub async fn stats(&self) -> AgentStats {
        let inner = self.inner.lock().await;
        let now = Utc::now();
        AgentStats {
            conversation_id: self.conversation_id.clone(),
            state: inner.state.as_str(),
            command_count: inner.command_count,
            created_at: inner.created_at,
            last_activity: inner.last_activity,
            uptime_seconds: inner.created_at.map(|t| (now - t).num_seconds()),
            idle_seconds: (now - inner.last_activity).num_seconds(),
            workspace: self.workspace.display().to_string(),
            memory_bytes: self.limits.memory_bytes,
            nano_cpus: self.limits.nano_cpus,
            idle_deadline_secs: self.idle_deadline.as_secs(),
        }
    }

    /// Current lifecycle state. Used by the manager for eviction decisions;
    /// `try_lock` keeps the check cooperative: a busy agent reports Running.
    pub fn state_nonblocking(&self) -> AgentState {
        match self.inner.try_lock() {
            Ok(inner) => inner.state,
            Err(_) => AgentState::Running,
        }
    }

    pub fn last_activity_nonblocking(&self) -> DateTime<Utc> {
        match self.inner.try_lock() {
            Ok(inner) => inner.last_activity,
            Err(_) => Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_agent(id: &str) -> Arc<ContainerAgent> {
        let docker = Docker::connect_with_local_defaults().expect("client construction is lazy");
        Arc::new(ContainerAgent::new(
            id,
            docker,
            "dockhand-agent:latest",
            std::env::temp_dir().join(format!("dockhand-agent-test-{id}")),
            ResourceLimits {
                memory_bytes: 2 * 1024 * 1024 * 1024,
                nano_cpus: 2_000_000_000,
            },
            Duration::ZERO,
        ))
    }

    #[tokio::test]
    async fn whitespace_command_is_a_no_op() {
        let agent = test_agent("ws");
        let outcome = agent.execute("   \n\t  ", None).await.unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.stdout.is_empty());
        assert!(outcome.stderr.is_empty());
        // No container was created and no state mutated.
        let stats = agent.stats().await;
        assert_eq!(stats.state, "not_created");
        assert_eq!(stats.command_count, 0);
    }

    #[tokio::test]
    async fn new_agent_starts_not_created() {
        let agent = test_agent("fresh");
        let stats = agent.stats().await;
        assert_eq!(stats.state, "not_created");
        assert!(stats.created_at.is_none());
        assert_eq!(stats.idle_deadline_secs, 0);
    }

    #[tokio::test]
    async fn shutdown_without_container_is_idempotent() {
        let agent = test_agent("idem");
        agent.shutdown(false).await;
        agent.shutdown(false).await;
        assert_eq!(agent.stats().await.state, "stopped");
    }

    #[test]
    fn stoppable_states() {
        assert!(AgentState::NotCreated.is_stoppable());
        assert!(AgentState::Stopped.is_stoppable());
        assert!(!AgentState::Running.is_stoppable());
        assert!(!AgentState::Starting.is_stoppable());
        assert!(!AgentState::Error.is_stoppable());
    }
}
