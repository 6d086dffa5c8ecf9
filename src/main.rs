//! Pagewatch CLI entry point.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pagewatch::config::EngineConfig;
use pagewatch::gateway;
use pagewatch::llm;
use pagewatch::orchestrator::{ChromiumSessionFactory, Orchestrator};
use pagewatch::server::{self, ServeState};
use pagewatch::storage::StorageManager;
use pagewatch::types::{task_signature, ExecutionMode, TaskInput, TaskOptions};

#[derive(Parser)]
#[command(name = "pagewatch", version, about = "Instruction-driven web page watcher")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a watch task once and print the result as JSON.
    Run {
        /// Natural-language extraction instruction.
        #[arg(long)]
        instruction: String,
        /// Target page URL.
        #[arg(long)]
        url: String,
        /// Task id; enables monitoring samples and change detection.
        #[arg(long)]
        task_id: Option<String>,
        /// Execution mode: plan, interactive, or auto.
        #[arg(long, default_value = "interactive")]
        mode: String,
        /// Generate and cache a plan without executing it.
        #[arg(long)]
        plan_only: bool,
        /// Replay a cached plan without generating a new one.
        #[arg(long)]
        execution_only: bool,
        /// Plan id for --execution-only.
        #[arg(long)]
        plan_id: Option<String>,
        /// Ignore any cached plan.
        #[arg(long)]
        force_new_plan: bool,
        /// Invocation deadline in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Generate a plan and print its step summary without executing.
    Plan {
        #[arg(long)]
        instruction: String,
        #[arg(long)]
        url: String,
    },
    /// Serve the HTTP API.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: SocketAddr,
    },
    /// Inspect or maintain the plan cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Print cache statistics.
    Stats,
    /// Delete expired cache entries.
    Cleanup,
    /// Invalidate the entry for an (instruction, url) pair.
    Invalidate {
        #[arg(long)]
        instruction: String,
        #[arg(long)]
        url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env();
    let orchestrator = Arc::new(build_orchestrator(&config).await?);

    match cli.command {
        Command::Run {
            instruction,
            url,
            task_id,
            mode,
            plan_only,
            execution_only,
            plan_id,
            force_new_plan,
            timeout_ms,
        } => {
            let options = TaskOptions {
                execution_mode: parse_mode(&mode)?,
                plan_only,
                execution_only,
                plan_id,
                force_new_plan,
                timeout_ms,
                ..TaskOptions::default()
            };
            let input = TaskInput {
                instruction,
                url,
                task_id,
                options,
            };
            let response = gateway::respond(orchestrator.run(input).await);
            println!("{}", response.body);
            if response.status_code >= 400 {
                std::process::exit(1);
            }
        }
        Command::Plan { instruction, url } => {
            let input = TaskInput {
                instruction,
                url,
                task_id: None,
                options: TaskOptions {
                    plan_only: true,
                    ..TaskOptions::default()
                },
            };
            let response = gateway::respond(orchestrator.run(input).await);
            println!("{}", response.body);
        }
        Command::Serve { addr } => {
            server::serve(ServeState { orchestrator }, addr)
                .await
                .map_err(|err| anyhow!("{err}"))?;
        }
        Command::Cache { action } => match action {
            CacheAction::Stats => {
                let stats = orchestrator
                    .cache()
                    .stats()
                    .await
                    .context("failed to read cache stats")?;
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
            CacheAction::Cleanup => {
                let removed = orchestrator
                    .cache()
                    .cleanup_expired()
                    .await
                    .context("cache cleanup failed")?;
                println!("removed {removed} expired entries");
            }
            CacheAction::Invalidate { instruction, url } => {
                let signature = task_signature(&instruction, &url);
                orchestrator
                    .cache()
                    .invalidate(&signature)
                    .await
                    .context("cache invalidation failed")?;
                println!("invalidated cache entry for signature {signature}");
            }
        },
    }

    Ok(())
}

async fn build_orchestrator(config: &EngineConfig) -> Result<Orchestrator> {
    let (primary, fallback) =
        llm::fallback_pair(config).map_err(|err| anyhow!("llm configuration: {err}"))?;
    let storage = StorageManager::from_config(config)
        .await
        .map_err(|err| anyhow!("storage: {err}"))?;
    Ok(Orchestrator::new(
        config.clone(),
        primary,
        fallback,
        storage,
        Arc::new(ChromiumSessionFactory),
    ))
}

fn parse_mode(raw: &str) -> Result<ExecutionMode> {
    match raw {
        "plan" => Ok(ExecutionMode::Plan),
        "interactive" => Ok(ExecutionMode::Interactive),
        "auto" => Ok(ExecutionMode::Auto),
        other => Err(anyhow!("unknown execution mode '{other}'")),
    }
}
