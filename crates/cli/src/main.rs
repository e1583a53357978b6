use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use orchestrator::planner::parse_steps;
use orchestrator::{Agent, EngineConfig, NoModel, TaskResponse, ToolRegistry};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use taskpilot_core::{Plan, TaskState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

const STATE_DIR: &str = ".taskpilot";
const CONFIG_FILE: &str = "taskpilot.toml";
const DEFAULT_DB_NAME: &str = "taskpilot.db";

#[derive(Parser)]
#[command(name = "taskpilot")]
#[command(about = "Run dependency-ordered task plans", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine configuration (TOML)
    #[arg(short, long, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// SQLite database holding task records and checkpoints
    #[arg(long)]
    db: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate and sort a plan file without running it
    Check { plan: PathBuf },
    /// Execute a plan file
    Run {
        plan: PathBuf,

        /// Task input as JSON
        #[arg(short, long)]
        input: Option<String>,

        /// Print engine events while running
        #[arg(long)]
        events: bool,
    },
    /// Continue an interrupted task from its latest checkpoint
    Resume { task_id: Uuid },
    /// List stored checkpoints of a task
    Checkpoints { task_id: Uuid },
    /// List stored tasks
    Tasks,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Check { plan } => check(&plan, config),
        Commands::Run {
            plan,
            input,
            events,
        } => run(&plan, input.as_deref(), events, config, cli.db).await,
        Commands::Resume { task_id } => resume(task_id, config, cli.db).await,
        Commands::Checkpoints { task_id } => checkpoints(task_id, config, cli.db).await,
        Commands::Tasks => tasks(config, cli.db).await,
    }
}

/// Missing file means defaults; an unreadable or invalid file is reported
/// and defaults are used.
fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "No config file, using defaults");
        return Ok(EngineConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => Ok(config),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Invalid config file, using defaults");
            Ok(EngineConfig::default())
        }
    }
}

/// A plan file is JSON: a step array, `{"steps": [...]}` or a full plan
/// object, optionally with a `description`.
fn load_plan(path: &Path, config: &EngineConfig) -> Result<Plan> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan {}", path.display()))?;

    if let Ok(plan) = serde_json::from_str::<Plan>(&content) {
        return Ok(plan);
    }

    let steps = parse_steps(&content, &config.planner)
        .map_err(|e| anyhow::anyhow!("Invalid plan file {}: {}", path.display(), e))?;
    let description = serde_json::from_str::<Value>(&content)
        .ok()
        .and_then(|v| v.get("description").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| {
            path.file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("plan")
                .to_string()
        });
    Ok(Plan::new(description, steps))
}

fn check(path: &Path, config: EngineConfig) -> Result<()> {
    let plan = load_plan(path, &config)?;
    let agent = Agent::new(
        Arc::new(NoModel),
        ToolRegistry::with_builtins(),
        Arc::new(db::MemoryStore::new()),
        config,
    );
    let plan = agent.planner().finalize(plan).context("Plan is invalid")?;

    println!();
    println!("Plan: {}", plan.task_description);
    println!("Steps ({}), estimated {} ms:", plan.len(), plan.estimated_duration_ms);
    for (i, step) in plan.steps.iter().enumerate() {
        let deps = if step.depends_on.is_empty() {
            String::new()
        } else {
            format!(" <- {}", step.depends_on.join(", "))
        };
        println!("  {:>2}. [{}] {}{}", i + 1, step.kind.as_str(), step.id, deps);
    }
    println!();
    Ok(())
}

async fn run(
    path: &Path,
    input: Option<&str>,
    show_events: bool,
    config: EngineConfig,
    db_path: Option<PathBuf>,
) -> Result<()> {
    let plan = load_plan(path, &config)?;
    let input: Value = match input {
        Some(raw) => serde_json::from_str(raw).context("--input is not valid JSON")?,
        None => Value::Null,
    };

    let agent = open_agent(config, db_path).await?;
    if show_events {
        print_events(&agent);
    }
    cancel_on_ctrl_c(&agent);

    let description = plan.task_description.clone();
    let response = agent.run_plan(&description, input, plan).await?;
    report(&response)
}

async fn resume(task_id: Uuid, config: EngineConfig, db_path: Option<PathBuf>) -> Result<()> {
    let agent = open_agent(config, db_path).await?;
    cancel_on_ctrl_c(&agent);

    let response = agent
        .resume(task_id)
        .await
        .with_context(|| format!("Failed to resume task {}", task_id))?;
    report(&response)
}

async fn checkpoints(task_id: Uuid, config: EngineConfig, db_path: Option<PathBuf>) -> Result<()> {
    let agent = open_agent(config, db_path).await?;
    let checkpoints = agent.checkpoints().list_checkpoints(task_id).await?;

    if checkpoints.is_empty() {
        println!("No checkpoints for task {}.", task_id);
        return Ok(());
    }

    println!("Checkpoints ({}):", checkpoints.len());
    for checkpoint in &checkpoints {
        println!(
            "  {} {} [{}] cursor={} results={}{}",
            checkpoint.timestamp.format("%Y-%m-%d %H:%M:%S"),
            checkpoint.id,
            checkpoint.state,
            checkpoint.cursor,
            checkpoint.results.len(),
            if checkpoint.can_resume { " resumable" } else { "" }
        );
    }
    Ok(())
}

async fn tasks(config: EngineConfig, db_path: Option<PathBuf>) -> Result<()> {
    let agent = open_agent(config, db_path).await?;
    let ids = agent.checkpoints().task_ids().await?;

    if ids.is_empty() {
        println!("No tasks yet.");
        return Ok(());
    }

    println!("Tasks ({}):", ids.len());
    for id in ids {
        let Some(record) = agent.checkpoints().load_task(id).await? else {
            continue;
        };
        let icon = match record.state() {
            TaskState::Idle => "○",
            TaskState::Planning => "◐",
            TaskState::Executing | TaskState::Waiting => "◑",
            TaskState::Complete => "●",
            TaskState::Error => "✗",
        };
        println!(
            "  {} {} [{}] {} ({} results)",
            icon,
            id,
            record.state(),
            record.task.description,
            record.results.len()
        );
    }
    Ok(())
}

async fn open_agent(config: EngineConfig, db_path: Option<PathBuf>) -> Result<Arc<Agent>> {
    let db_path = match db_path {
        Some(path) => path,
        None => {
            let dir = std::env::current_dir()?.join(STATE_DIR);
            tokio::fs::create_dir_all(&dir).await?;
            dir.join(DEFAULT_DB_NAME)
        }
    };

    let database_url = format!("sqlite:{}", db_path.display());
    tracing::info!("Database: {}", db_path.display());
    let store = db::open_kv_store(&database_url)
        .await
        .context("Failed to open task database")?;

    Ok(Arc::new(Agent::new(
        Arc::new(NoModel),
        ToolRegistry::with_builtins(),
        Arc::new(store),
        config,
    )))
}

fn print_events(agent: &Agent) {
    let mut rx = agent.events().subscribe();
    tokio::spawn(async move {
        while let Ok(envelope) = rx.recv().await {
            match serde_json::to_string(&envelope) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!("Failed to encode event: {}", e),
            }
        }
    });
}

fn cancel_on_ctrl_c(agent: &Arc<Agent>) {
    let agent = Arc::clone(agent);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling task");
            agent.cancel().await;
        }
    });
}

fn report(response: &TaskResponse) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(response)?);
    if !response.is_success() {
        bail!(
            "Task {} ended in state {}: {}",
            response.task_id,
            response.state,
            response.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskpilot=info,orchestrator=info,db=info".into()),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator::CheckpointPolicy;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_partial_config_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            "replan_on_failure = true\n\n[executor]\nmax_concurrency = 2\n\n[checkpoint]\npolicy = \"manual\"\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert!(config.replan_on_failure);
        assert_eq!(config.executor.max_concurrency, 2);
        assert_eq!(config.checkpoint.policy, CheckpointPolicy::Manual);
        assert_eq!(config.planner.max_steps, 50);
    }

    #[test]
    fn test_invalid_config_falls_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "executor = [not toml").unwrap();
        assert_eq!(load_config(&path).unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_plan_file_formats() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::default();

        let array = dir.path().join("fetch.json");
        std::fs::write(&array, r#"[{"id": "a", "tool": "echo", "params": {"value": 1}}]"#).unwrap();
        let plan = load_plan(&array, &config).unwrap();
        assert_eq!(plan.task_description, "fetch");
        assert_eq!(plan.steps[0].tool_name(), Some("echo"));

        let object = dir.path().join("obj.json");
        std::fs::write(
            &object,
            r#"{"description": "Report", "steps": [{"id": "a", "type": "model", "params": {"prompt": "hi"}}]}"#,
        )
        .unwrap();
        let plan = load_plan(&object, &config).unwrap();
        assert_eq!(plan.task_description, "Report");
        assert_eq!(plan.len(), 1);

        let garbage = dir.path().join("bad.json");
        std::fs::write(&garbage, "not a plan").unwrap();
        assert!(load_plan(&garbage, &config).is_err());
    }
}
