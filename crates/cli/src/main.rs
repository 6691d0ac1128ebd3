use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

use dockhand_config::AppConfig;
use dockhand_llm::AnthropicClient;
use dockhand_runtime::{Runtime, RuntimeLayout};

#[derive(Debug, Parser)]
#[command(name = "dockhand", version, about = "Container-sandboxed AI agent runtime")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "dockhand.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the runtime with a line-oriented console ingress.
    Run {
        /// Conversation id to attach to; generated when omitted.
        #[arg(long)]
        conversation_id: Option<String>,
    },
    /// Report active conversations and container states.
    Status,
    /// Dump the runtime filesystem layout.
    RuntimeInfo,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.telemetry.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run { conversation_id } => run(config, conversation_id).await,
        Commands::Status => status(config).await,
        Commands::RuntimeInfo => runtime_info(config),
    }
}

/// Console ingress: each stdin line is one prompt for the attached
/// conversation. The transport behind `handle_prompt` is pluggable; this is
/// the minimal one.
async fn run(config: AppConfig, conversation_id: Option<String>) -> Result<()> {
    // Fatal configuration problems surface before anything starts.
    let api_key = config.api_key()?;
    let api = Arc::new(AnthropicClient::new(api_key, config.llm.base_url.clone()));

    let runtime = Runtime::new(config, api).context("runtime startup failed")?;
    let conversation_id = conversation_id.unwrap_or_else(Runtime::generate_conversation_id);

    println!("dockhand ready (conversation {conversation_id})");
    println!("type a prompt and press enter; Ctrl-D or Ctrl-C to exit");

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(prompt) if !prompt.trim().is_empty() => {
                        match runtime.handle_prompt(&conversation_id, prompt.trim()).await {
                            Ok(reply) => println!("{reply}"),
                            Err(err) => eprintln!("error: {err:#}"),
                        }
                    }
                    Some(_) => {}
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    info!("shutting down");
    runtime.shutdown().await;
    Ok(())
}

/// Cross-process view: conversation directories on disk plus any of our
/// containers the daemon knows about.
async fn status(config: AppConfig) -> Result<()> {
    let layout = RuntimeLayout::new(&config.runtime.runtime_dir)?;
    let conversations = layout.list_conversations();

    println!("runtime directory: {}", layout.root().display());
    println!("conversations: {}", conversations.len());
    for id in &conversations {
        println!("  - {id}");
    }

    match bollard::Docker::connect_with_local_defaults() {
        Ok(docker) => {
            let options = bollard::container::ListContainersOptions {
                all: true,
                filters: HashMap::from([("name".to_string(), vec!["dockhand-agent-".to_string()])]),
                ..Default::default()
            };
            match docker.list_containers(Some(options)).await {
                Ok(containers) => {
                    println!("containers: {}", containers.len());
                    for container in containers {
                        let name = container
                            .names
                            .unwrap_or_default()
                            .first()
                            .map(|n| n.trim_start_matches('/').to_string())
                            .unwrap_or_else(|| "<unnamed>".to_string());
                        println!("  - {name}: {}", container.state.unwrap_or_default());
                    }
                }
                Err(err) => println!("containers: unavailable ({err})"),
            }
        }
        Err(err) => println!("containers: daemon unreachable ({err})"),
    }
    Ok(())
}

fn runtime_info(config: AppConfig) -> Result<()> {
    let layout = RuntimeLayout::new(&config.runtime.runtime_dir)?;

    println!("runtime directory: {}", layout.root().display());
    println!("agent memory:      {}", layout.agent_memory_dir().display());
    println!("workspaces:        {}", layout.working_dir_base().display());

    let conversations = layout.list_conversations();
    println!("\nconversations: {}", conversations.len());
    for id in &conversations {
        println!("\n  {id}:");
        println!("    data:      {}", layout.conversation_data_dir(id).display());
        let working = layout.working_dir(id);
        println!("    workspace: {}", working.display());
        for link in ["agent-memory", "conversation_data"] {
            let path = working.join(link);
            if path.is_symlink() {
                let target = std::fs::read_link(&path)
                    .map(|t| t.display().to_string())
                    .unwrap_or_else(|_| "?".to_string());
                println!("    {link} -> {target}");
            }
        }
    }
    Ok(())
}
