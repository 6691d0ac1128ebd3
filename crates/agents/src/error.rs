use std::time::Duration;

use thiserror::Error;

/// Failure modes of container-backed command execution.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Container could not be brought to Running within the startup window.
    #[error("failed to initialize container for conversation {conversation_id}: {reason}")]
    InitFailed {
        conversation_id: String,
        reason: String,
    },

    /// Exec exceeded its bound. Container and shell state survive.
    #[error("command timed out after {}s", .0.as_secs())]
    CommandTimeout(Duration),

    /// Container disappeared or entered an unexpected state. The next
    /// execute recreates it with fresh shell state.
    #[error("container for conversation {0} was lost; it will be recreated on the next command")]
    ContainerLost(String),

    /// Fatal configuration: the sandbox image does not exist on the daemon.
    #[error("container image `{0}` not found; build or pull it before starting")]
    ImageMissing(String),

    #[error("container daemon error: {0}")]
    Daemon(#[from] bollard::errors::Error),
}

impl AgentError {
    /// Fatal errors abort the run instead of becoming tool results.
    pub fn is_config_fatal(&self) -> bool {
        matches!(self, Self::ImageMissing(_))
    }
}
