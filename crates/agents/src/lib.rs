//! Per-conversation sandbox containers.
//!
//! [`ContainerAgent`] owns exactly one container for one conversation:
//! lazy creation on first command, persistent shell state across execs,
//! an idle deadline, and self-healing after a lost container.
//! [`AgentManager`] is the process-wide registry with admission control,
//! eviction, and a periodic reaper.

pub mod agent;
pub mod error;
pub mod manager;

pub use agent::{AgentOverrides, AgentState, AgentStats, ContainerAgent, ExecOutcome, ResourceLimits};
pub use error::AgentError;
pub use manager::{AgentManager, AgentManagerConfig, ManagerStats};
