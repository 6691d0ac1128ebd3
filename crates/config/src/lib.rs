use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Primary model id sent on every request until the retry loop falls back.
    pub model: String,
    /// Backup model activated after `fallback_retry_count` retries.
    pub backup_model: String,
    pub max_tokens: u32,
    pub base_url: String,
    /// System prompt text. Empty string means no system prompt is sent.
    pub system_prompt: String,
    /// Server-side built-in tools to enable ("web_search", "web_fetch",
    /// "text_editor"). Empty by default; the operator opts in.
    pub builtin_tools: Vec<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "claude-opus-4-1-20250805".to_string(),
            backup_model: "claude-sonnet-4-20250514".to_string(),
            max_tokens: 32_000,
            base_url: "https://api.anthropic.com".to_string(),
            system_prompt: String::new(),
            builtin_tools: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_backoff_secs: f64,
    pub max_backoff_secs: f64,
    pub backoff_multiplier: f64,
    /// Number of retries on the primary model before switching to the backup.
    pub fallback_retry_count: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_secs: 0.1,
            max_backoff_secs: 3.0,
            backoff_multiplier: 2.0,
            fallback_retry_count: 10,
        }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.initial_backoff_secs.max(0.0))
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.max_backoff_secs.max(0.0))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Image used for per-conversation containers.
    pub image: String,
    /// Memory limit per container, docker-style suffix ("2g", "512m").
    pub memory_limit: String,
    /// CPU quota per container, in whole or fractional CPUs.
    pub cpu_limit: f64,
    /// Seconds a Running container may sit idle before it is stopped.
    /// Zero disables automatic stopping.
    pub idle_deadline_secs: u64,
    /// Upper bound on registered agents before eviction kicks in.
    pub max_agents: usize,
    /// Default per-command timeout in seconds.
    pub command_timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "dockhand-agent:latest".to_string(),
            memory_limit: "2g".to_string(),
            cpu_limit: 2.0,
            idle_deadline_secs: 0,
            max_agents: 100,
            command_timeout_secs: 120,
        }
    }
}

impl SandboxConfig {
    /// Parse the docker-style memory limit into bytes.
    pub fn memory_bytes(&self) -> Result<i64> {
        parse_memory_limit(&self.memory_limit)
    }

    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_limit * 1_000_000_000.0) as i64
    }

    pub fn idle_deadline(&self) -> Duration {
        Duration::from_secs(self.idle_deadline_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Base directory for agent-memory, conversation-data, and workspaces.
    pub runtime_dir: String,
    /// When true, `shutdown_all` also deletes conversation workspaces.
    pub remove_data_on_shutdown: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runtime_dir: "dockhand_runtime".to_string(),
            remove_data_on_shutdown: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OverlayConfig {
    /// Command line launched as the "working" status window. Empty disables
    /// the overlay entirely.
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub retry: RetryConfig,
    pub sandbox: SandboxConfig,
    pub runtime: RuntimeConfig,
    pub overlay: OverlayConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Load from a TOML file (missing file yields defaults), then apply
    /// environment overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw).context("malformed configuration file")?;
        }
        config.apply_env();
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Environment variables win over the file for operational knobs.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_string("DOCKHAND_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = env_string("DOCKHAND_BACKUP_MODEL") {
            self.llm.backup_model = v;
        }
        if let Some(v) = env_parse::<f64>("DOCKHAND_INITIAL_BACKOFF") {
            self.retry.initial_backoff_secs = v;
        }
        if let Some(v) = env_parse::<f64>("DOCKHAND_MAX_BACKOFF") {
            self.retry.max_backoff_secs = v;
        }
        if let Some(v) = env_parse::<f64>("DOCKHAND_BACKOFF_MULTIPLIER") {
            self.retry.backoff_multiplier = v;
        }
        if let Some(v) = env_parse::<u32>("DOCKHAND_FALLBACK_RETRY_COUNT") {
            self.retry.fallback_retry_count = v;
        }
        if let Some(v) = env_parse::<usize>("DOCKHAND_MAX_AGENTS") {
            self.sandbox.max_agents = v;
        }
        if let Some(v) = env_parse::<u64>("DOCKHAND_IDLE_DEADLINE") {
            self.sandbox.idle_deadline_secs = v;
        }
        if let Some(v) = env_string("DOCKHAND_RUNTIME_DIR") {
            self.runtime.runtime_dir = v;
        }
    }

    /// The API key is never stored in the config file.
    pub fn api_key(&self) -> Result<String> {
        match env::var("ANTHROPIC_API_KEY") {
            Ok(key) if !key.trim().is_empty() => Ok(key),
            _ => bail!(
                "ANTHROPIC_API_KEY not set. Export it or add it to the .env file before starting."
            ),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}

/// Parse "2g" / "512m" / "100k" / plain bytes into a byte count.
pub fn parse_memory_limit(raw: &str) -> Result<i64> {
    let trimmed = raw.trim().to_lowercase();
    if trimmed.is_empty() {
        bail!("empty memory limit");
    }
    let (digits, multiplier) = match trimmed.chars().last() {
        Some('k') => (&trimmed[..trimmed.len() - 1], 1_024i64),
        Some('m') => (&trimmed[..trimmed.len() - 1], 1_024i64 * 1_024),
        Some('g') => (&trimmed[..trimmed.len() - 1], 1_024i64 * 1_024 * 1_024),
        _ => (trimmed.as_str(), 1),
    };
    let value: i64 = digits
        .parse()
        .with_context(|| format!("invalid memory limit `{raw}`"))?;
    Ok(value * multiplier)
}
