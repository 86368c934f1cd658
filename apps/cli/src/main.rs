//! Ensemble orchestrator CLI.
//!
//! Exit codes for `workflow run`: 0 success, 1 validation failed, 2 runtime
//! error, 3 blocked by a deployment gate, 130 cancelled.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use ensemble_core::config::OrchestratorConfig;
use ensemble_core::model::{NodeKind, WorkflowStatus};
use ensemble_core::{AccessController, CoreError, EventBus, StateStore};
use ensemble_teams::manager::{Actor, TeamManager};
use ensemble_teams::provider::{AgentProvider, ChatMessage, ProviderRouter, ScriptedProvider};
use ensemble_workflow::executor::{ExecutionContext, NodeExecutor};
use ensemble_workflow::healing::ExecutionHistoryLogger;
use ensemble_workflow::{
    standard_registry, DagExecutor, ExecuteOptions, HealingLoop, WorkflowSpec,
};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ensemble", about = "Multi-agent software delivery orchestrator")]
struct Cli {
    /// Path to the orchestrator state database.
    #[arg(long, global = true, default_value = "ensemble.db")]
    db: PathBuf,
    /// Optional JSON configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Team lifecycle operations.
    Team {
        #[command(subcommand)]
        command: TeamCommand,
    },
    /// Role binding operations.
    Role {
        #[command(subcommand)]
        command: RoleCommand,
    },
    /// Workflow execution.
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommand,
    },
    /// Execution history queries.
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },
}

#[derive(Subcommand)]
enum TeamCommand {
    /// Create a team and seed the standard role set.
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        project_type: String,
    },
}

#[derive(Subcommand)]
enum RoleCommand {
    Assign {
        #[arg(long)]
        team: String,
        #[arg(long)]
        role: String,
        #[arg(long)]
        agent: String,
    },
    Reassign {
        #[arg(long)]
        team: String,
        #[arg(long)]
        role: String,
        #[arg(long)]
        agent: String,
    },
    Unassign {
        #[arg(long)]
        team: String,
        #[arg(long)]
        role: String,
    },
}

#[derive(Subcommand)]
enum WorkflowCommand {
    /// Build a workflow from a spec file and run it, streaming node events.
    Run {
        #[arg(long)]
        team: String,
        #[arg(long, conflicts_with = "resume")]
        spec: Option<PathBuf>,
        /// Resume a previously registered workflow by id.
        #[arg(long)]
        resume: Option<String>,
        /// Continue past failed nodes instead of halting.
        #[arg(long)]
        continue_on_error: bool,
    },
}

#[derive(Subcommand)]
enum HistoryCommand {
    /// Aggregated execution metrics as JSON.
    Metrics {
        #[arg(long)]
        task: Option<String>,
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
}

/// Runs phase and action nodes through the persona-routed agent provider.
struct AgentNodeExecutor {
    router: ProviderRouter,
}

#[async_trait]
impl NodeExecutor for AgentNodeExecutor {
    async fn execute(
        &self,
        node: &ensemble_core::model::WorkflowNode,
        ctx: &ExecutionContext,
    ) -> std::result::Result<Value, CoreError> {
        let persona = node.assigned_agent.as_deref().unwrap_or("default");
        let provider = self.router.provider_for(persona);
        let prompt = format!(
            "Execute workflow node '{}' ({}) with inputs {} and global context {}",
            node.name, node.id, node.inputs, ctx.global
        );
        let mut stream = provider
            .chat(&[ChatMessage::user(prompt)], 1024, None)
            .await?;
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            if let Some(delta) = chunk?.delta_text {
                text.push_str(&delta);
            }
        }
        Ok(json!({
            "node": node.id,
            "agent_output": text.trim(),
            "status": "completed",
        }))
    }
}

fn load_config(cli: &Cli) -> Result<OrchestratorConfig> {
    match &cli.config {
        Some(path) => OrchestratorConfig::load(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(OrchestratorConfig::default()),
    }
}

fn history_path(db: &std::path::Path, config: &OrchestratorConfig) -> PathBuf {
    if config.history.storage_path != ensemble_core::config::HistoryConfig::default().storage_path
    {
        return PathBuf::from(&config.history.storage_path);
    }
    db.with_extension("history.db")
}

async fn run() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let store = Arc::new(StateStore::open(&cli.db)?);
    let bus = Arc::new(EventBus::new());
    let access = Arc::new(match &config.access_matrix {
        Some(matrix) => AccessController::new(matrix.clone()),
        None => AccessController::standard(),
    });

    match cli.command {
        Command::Team {
            command: TeamCommand::Create { name, project_type },
        } => {
            let manager = TeamManager::new(Arc::clone(&store), Arc::clone(&bus), access)?
                .with_scaling_plan(config.scaling_plan());
            let team = manager.create_team(&name, &project_type, None).await?;
            manager.initialize_standard_roles(&team.id).await?;
            println!("{}", team.id);
            Ok(ExitCode::SUCCESS)
        }
        Command::Role { command } => {
            let manager = TeamManager::new(Arc::clone(&store), Arc::clone(&bus), access)?;
            let actor = Actor::system();
            match command {
                RoleCommand::Assign { team, role, agent } => {
                    let updated = manager
                        .assign_agent_to_role(&team, &role, &agent, &actor, "cli assignment")
                        .await?;
                    println!(
                        "{}",
                        json!({"role_id": updated.role_id, "current_agent_id": updated.current_agent_id})
                    );
                }
                RoleCommand::Reassign { team, role, agent } => {
                    let updated = manager
                        .reassign_role(&team, &role, &agent, &actor, "cli reassignment")
                        .await?;
                    println!(
                        "{}",
                        json!({"role_id": updated.role_id, "current_agent_id": updated.current_agent_id})
                    );
                }
                RoleCommand::Unassign { team, role } => {
                    manager
                        .unassign_role(&team, &role, &actor, "cli unassignment")
                        .await?;
                    println!("{}", json!({"role_id": role, "current_agent_id": Value::Null}));
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Workflow {
            command:
                WorkflowCommand::Run {
                    team,
                    spec,
                    resume,
                    continue_on_error,
                },
        } => {
            store.get_team(&team)?;
            let history = Arc::new(ExecutionHistoryLogger::open(
                ensemble_core::config::HistoryConfig {
                    storage_path: history_path(&cli.db, &config)
                        .to_string_lossy()
                        .into_owned(),
                    ..config.history.clone()
                },
            )?);
            let mut registry = standard_registry(Arc::clone(&store));
            let router = ProviderRouter::new(Arc::new(ScriptedProvider::echo()) as Arc<dyn AgentProvider>);
            let agent_executor = Arc::new(AgentNodeExecutor { router });
            registry.register_kind(NodeKind::Action, Arc::clone(&agent_executor) as Arc<dyn NodeExecutor>);
            registry.register_kind(NodeKind::Phase, agent_executor);

            let healing = Arc::new(HealingLoop::new(history, &config.scheduler));
            let executor = DagExecutor::new(
                Arc::clone(&store),
                Arc::clone(&bus),
                registry,
                healing,
                config.scheduler.clone(),
            );

            let (workflow_id, fail_fast) = match (resume, spec) {
                (Some(id), _) => (id, !continue_on_error),
                (None, Some(path)) => {
                    let parsed = WorkflowSpec::load(&path)
                        .with_context(|| format!("loading spec {}", path.display()))?;
                    let fail_fast = parsed.fail_on_validation_error && !continue_on_error;
                    let dag = ensemble_workflow::build(&parsed, &team)?;
                    executor.register(&dag)?;
                    (dag.id, fail_fast)
                }
                (None, None) => anyhow::bail!("workflow run needs --spec or --resume"),
            };

            // Stream node and workflow events while the run progresses.
            let mut events = bus.subscribe(format!("team:{team}:events:*"));
            let printer = tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    println!("{} {}", event.topic, event.payload);
                }
            });

            let cancellation = CancellationToken::new();
            let ctrl_c_cancel = cancellation.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    ctrl_c_cancel.cancel();
                }
            });

            let result = executor
                .execute(
                    &workflow_id,
                    ExecuteOptions {
                        fail_on_validation_error: fail_fast,
                        cancellation,
                        global_context: json!({"team_id": team}),
                    },
                )
                .await;
            printer.abort();

            let result = match result {
                Ok(result) => result,
                Err(err) => {
                    eprintln!("workflow error: {err}");
                    return Ok(ExitCode::from(2));
                }
            };
            if let Some(recovery) = &result.recovery {
                eprintln!(
                    "recovery context: {}",
                    serde_json::to_string_pretty(recovery)?
                );
                let artifacts = ensemble_workflow::ArtifactStore::new(
                    PathBuf::from(format!("{}_artifacts", result.workflow_id)),
                )?;
                let path = artifacts.write_recovery(&result.workflow_id, recovery)?;
                eprintln!("recovery context saved to {}", path.display());
            }
            println!(
                "{}",
                json!({
                    "workflow_id": result.workflow_id,
                    "status": result.status.name(),
                    "nodes_run": result.nodes_run,
                })
            );
            let code = match result.status {
                WorkflowStatus::Completed => 0,
                WorkflowStatus::Cancelled => 130,
                _ => match result.failure.as_ref().map(|f| f.category.as_str()) {
                    Some("gate_blocked") => 3,
                    Some("validation") | Some("conflicting_state") => 1,
                    _ => 1,
                },
            };
            Ok(ExitCode::from(code))
        }
        Command::History {
            command: HistoryCommand::Metrics { task, days },
        } => {
            let history = ExecutionHistoryLogger::open(ensemble_core::config::HistoryConfig {
                storage_path: history_path(&cli.db, &config)
                    .to_string_lossy()
                    .into_owned(),
                ..config.history.clone()
            })?;
            let metrics = history.get_metrics(task.as_deref(), days)?;
            let mut payload = serde_json::to_value(&metrics)?;
            payload["success_rate"] = json!(metrics.success_rate());
            payload["recovery_rate"] = json!(metrics.recovery_rate());
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}
