//! CLI command definitions for devloop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::collaborators::{
    DisabledSearch, HttpSearchClient, LlmAnalyzer, LocalFileSystem, WebSearch,
};
use crate::error::OrchestratorError;
use crate::graph::{Task, TaskGraph};
use crate::llm::LiteLlmClient;
use crate::metrics::{export_metrics, init_metrics};
use crate::orchestrator::{DispatchMode, OrchestratorConfig, RunReport, TaskOrchestrator};
use crate::sandbox::{resolve_environment, DockerBackend, Sandbox, SandboxSpec};
use crate::state::{CheckpointStore, ProjectState};

/// Environment variable holding the SearXNG-compatible search endpoint.
const SEARCH_URL_ENV: &str = "DEVLOOP_SEARCH_URL";

/// Develop-execute-evaluate loop over sandboxed, generated code.
#[derive(Parser)]
#[command(name = "devloop")]
#[command(about = "Turn requirements into a task graph and run generated code in sandboxes")]
#[command(version)]
#[command(
    long_about = "devloop reads a project's requirements, asks an LLM to break them into tasks, generates code for each task, runs it in a resource-limited Docker sandbox and applies the follow-up actions to the project.\n\nLLM access is configured with LITELLM_API_BASE, LITELLM_API_KEY and LITELLM_DEFAULT_MODEL.\n\nExample usage:\n  devloop run --project ./my-project --workers 4"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run one develop-execute-evaluate pass over a project.
    Run(RunArgs),

    /// Validate a task list and print its execution order.
    Plan(PlanArgs),

    /// Inspect or merge checkpointed project state.
    State(StateArgs),

    /// Run commands in a one-off sandbox.
    Sandbox(SandboxArgs),
}

/// Arguments for `devloop run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Project directory holding the requirements file.
    #[arg(short, long)]
    pub project: PathBuf,

    /// Number of concurrent workers (overrides DEVLOOP_MAX_WORKERS).
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Dispatch mode: priority or dependencies (overrides DEVLOOP_DISPATCH_MODE).
    #[arg(long)]
    pub dispatch: Option<DispatchMode>,

    /// Seed state from the latest checkpoint and skip completed tasks.
    #[arg(long)]
    pub resume: bool,

    /// With --resume, run tasks again even if they already completed.
    #[arg(long, requires = "resume")]
    pub rerun_completed: bool,

    /// Write a checkpoint after every completed task.
    #[arg(long)]
    pub checkpoint_each_task: bool,

    /// Write Prometheus metrics to this file when the run ends.
    #[arg(long)]
    pub metrics_out: Option<PathBuf>,

    /// Print the run report as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `devloop plan`.
#[derive(Parser, Debug)]
pub struct PlanArgs {
    /// YAML or JSON file with a list of tasks.
    #[arg(short, long)]
    pub tasks: PathBuf,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct StateArgs {
    #[command(subcommand)]
    pub command: StateSubcommand,
}

#[derive(clap::Subcommand, Debug)]
pub enum StateSubcommand {
    /// Print the latest checkpoint of a project.
    Show {
        #[arg(short, long)]
        project: PathBuf,
    },

    /// Merge a state file into the latest checkpoint and save a new one.
    Merge {
        #[arg(short, long)]
        project: PathBuf,

        /// JSON file with the state to merge in.
        #[arg(long)]
        from: PathBuf,
    },
}

#[derive(Parser, Debug)]
pub struct SandboxArgs {
    #[command(subcommand)]
    pub command: SandboxSubcommand,
}

#[derive(clap::Subcommand, Debug)]
pub enum SandboxSubcommand {
    /// Run one command in a fresh sandbox and print its output and stats.
    Exec(SandboxExecArgs),
}

/// Arguments for `devloop sandbox exec`.
#[derive(Parser, Debug)]
pub struct SandboxExecArgs {
    /// Container image (defaults to the bash environment image).
    #[arg(long)]
    pub image: Option<String>,

    /// Command timeout in seconds.
    #[arg(long, default_value = "30")]
    pub timeout_secs: u64,

    /// Memory ceiling in MB.
    #[arg(long)]
    pub memory_mb: Option<u64>,

    /// Command and arguments.
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

/// Parse CLI arguments and return the Cli struct.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse arguments and run the selected command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_project_command(args).await,
        Commands::Plan(args) => run_plan_command(args).await,
        Commands::State(args) => match args.command {
            StateSubcommand::Show { project } => run_state_show_command(&project).await,
            StateSubcommand::Merge { project, from } => {
                run_state_merge_command(&project, &from).await
            }
        },
        Commands::Sandbox(args) => match args.command {
            SandboxSubcommand::Exec(args) => run_sandbox_exec_command(args).await,
        },
    }
}

// ============================================================================
// run
// ============================================================================

async fn run_project_command(args: RunArgs) -> anyhow::Result<()> {
    if !args.project.is_dir() {
        anyhow::bail!(
            "Project directory does not exist: {}",
            args.project.display()
        );
    }

    let mut config = OrchestratorConfig::from_env().context("Invalid DEVLOOP_* configuration")?;
    if let Some(workers) = args.workers {
        config = config.with_num_workers(workers);
    }
    if let Some(mode) = args.dispatch {
        config = config.with_dispatch_mode(mode);
    }
    if args.resume {
        config = config.with_resume(true);
    }
    if args.rerun_completed {
        config = config.with_rerun_completed(true);
    }
    if args.checkpoint_each_task {
        config = config.with_checkpoint_each_task(true);
    }
    config.validate()?;

    init_metrics().context("Failed to initialize metrics")?;

    let llm_client = LiteLlmClient::from_env().context("LLM client is not configured")?;
    info!(
        api_base = %llm_client.api_base(),
        model = %llm_client.default_model(),
        "Using LLM endpoint"
    );
    let analyzer = Arc::new(LlmAnalyzer::with_defaults(Arc::new(llm_client)));
    let backend = Arc::new(
        DockerBackend::new().context("Docker is unavailable; the sandbox needs a Docker daemon")?,
    );

    let orchestrator = TaskOrchestrator::new(
        analyzer,
        Arc::new(LocalFileSystem::new()),
        build_search_client()?,
        backend,
        config,
    );

    let cancel = CancellationToken::new();
    spawn_ctrl_c_handler(cancel.clone());

    let result = orchestrator.process_project(&args.project, &cancel).await;

    if let Some(path) = &args.metrics_out {
        tokio::fs::write(path, export_metrics())
            .await
            .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
    }

    match result {
        Ok(report) => {
            print_report(&report, args.json)?;
            Ok(())
        }
        Err(e) => {
            if let Some(report) = e.report() {
                print_report(report, args.json)?;
            }
            Err(run_error(e))
        }
    }
}

fn build_search_client() -> anyhow::Result<Arc<dyn WebSearch>> {
    match std::env::var(SEARCH_URL_ENV) {
        Ok(url) if !url.trim().is_empty() => {
            let client = HttpSearchClient::new(url.trim())
                .with_context(|| format!("Invalid {}", SEARCH_URL_ENV))?;
            Ok(Arc::new(client))
        }
        _ => {
            info!("{} not set, web search actions will fail", SEARCH_URL_ENV);
            Ok(Arc::new(DisabledSearch))
        }
    }
}

fn spawn_ctrl_c_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            cancel.cancel();
        }
    });
}

fn print_report(report: &RunReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", report.to_json_pretty()?);
    } else {
        print!("{}", report.render_text());
    }
    Ok(())
}

fn run_error(e: OrchestratorError) -> anyhow::Error {
    match e {
        OrchestratorError::PartialFailure { .. } | OrchestratorError::Cancelled { .. } => {
            anyhow::anyhow!("{}", e)
        }
        other => anyhow::Error::new(other).context("Project run failed"),
    }
}

// ============================================================================
// plan
// ============================================================================

#[derive(Debug, Serialize)]
struct PlanEntry {
    id: String,
    priority: i32,
    environment: String,
    dependencies: Vec<String>,
}

async fn run_plan_command(args: PlanArgs) -> anyhow::Result<()> {
    let content = tokio::fs::read_to_string(&args.tasks)
        .await
        .with_context(|| format!("Failed to read {}", args.tasks.display()))?;
    let tasks = parse_task_list(&args.tasks, &content)?;
    for task in &tasks {
        task.validate()?;
    }
    let graph = TaskGraph::build(tasks)?;

    let order: Vec<PlanEntry> = graph
        .sort_by_priority()
        .into_iter()
        .map(|task| PlanEntry {
            priority: task.priority,
            environment: resolve_environment(&task.execution_environment)
                .name
                .to_string(),
            dependencies: task.dependencies,
            id: task.id,
        })
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&order)?);
        return Ok(());
    }

    println!("{} tasks, no cycles", order.len());
    for (i, entry) in order.iter().enumerate() {
        let deps = if entry.dependencies.is_empty() {
            String::new()
        } else {
            format!(" (after {})", entry.dependencies.join(", "))
        };
        println!(
            "  {:>3}. {} [priority {}, {}]{}",
            i + 1,
            entry.id,
            entry.priority,
            entry.environment,
            deps
        );
    }
    Ok(())
}

/// Parses a task list as JSON for `.json` files and YAML otherwise.
///
/// Both a bare list and a `{tasks: [...]}` wrapper are accepted.
fn parse_task_list(path: &Path, content: &str) -> anyhow::Result<Vec<Task>> {
    #[derive(serde::Deserialize)]
    #[serde(untagged)]
    enum TaskList {
        Wrapped { tasks: Vec<Task> },
        Bare(Vec<Task>),
    }

    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let list: TaskList = if is_json {
        serde_json::from_str(content)
            .with_context(|| format!("Invalid JSON task list in {}", path.display()))?
    } else {
        serde_yaml::from_str(content)
            .with_context(|| format!("Invalid YAML task list in {}", path.display()))?
    };

    Ok(match list {
        TaskList::Wrapped { tasks } | TaskList::Bare(tasks) => tasks,
    })
}

// ============================================================================
// state
// ============================================================================

fn checkpoint_store(project: &Path) -> anyhow::Result<CheckpointStore> {
    let config = OrchestratorConfig::from_env().context("Invalid DEVLOOP_* configuration")?;
    Ok(CheckpointStore::new(project.join(config.checkpoint_dir)))
}

async fn run_state_show_command(project: &Path) -> anyhow::Result<()> {
    let store = checkpoint_store(project)?;
    let (path, state) = store
        .load_latest_if_any()
        .await?
        .with_context(|| format!("No checkpoint found in {}", store.dir().display()))?;

    info!(path = %path.display(), "Loaded checkpoint");
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

async fn run_state_merge_command(project: &Path, from: &Path) -> anyhow::Result<()> {
    let content = tokio::fs::read_to_string(from)
        .await
        .with_context(|| format!("Failed to read {}", from.display()))?;
    let incoming: ProjectState = serde_json::from_str(&content)
        .with_context(|| format!("{} is not a project state document", from.display()))?;

    let store = checkpoint_store(project)?;
    let (path, state) = store.update(incoming).await?;

    println!("Merged state written to {}", path.display());
    println!(
        "  {} files, {} variables, {} completed tasks",
        state.files.len(),
        state.variables.len(),
        state.completed_tasks.len()
    );
    Ok(())
}

// ============================================================================
// sandbox
// ============================================================================

async fn run_sandbox_exec_command(args: SandboxExecArgs) -> anyhow::Result<()> {
    let config = OrchestratorConfig::from_env().context("Invalid DEVLOOP_* configuration")?;
    let mut limits = config.limits;
    if let Some(memory_mb) = args.memory_mb {
        limits.memory_mb = memory_mb;
    }
    limits
        .validate()
        .map_err(|reason| anyhow::anyhow!("Invalid resource limits: {}", reason))?;

    let image = args
        .image
        .unwrap_or_else(|| resolve_environment("bash").image.to_string());
    let name = format!("devloop-exec-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
    let backend = Arc::new(DockerBackend::new().context("Docker is unavailable")?);
    let mut sandbox = Sandbox::new(backend, SandboxSpec::new(name, image).with_limits(limits));

    let cancel = CancellationToken::new();
    spawn_ctrl_c_handler(cancel.clone());

    let result = async {
        sandbox.start().await?;
        let output = sandbox
            .execute_command(&args.command, Duration::from_secs(args.timeout_secs), &cancel)
            .await;
        let stats = sandbox.stats().await.ok();
        let logs = sandbox.logs().await.ok();
        Ok::<_, crate::error::SandboxError>((output, stats, logs))
    }
    .await;

    if let Err(e) = sandbox.stop().await {
        warn!(error = %e, "Failed to clean up sandbox");
    }

    let (output, stats, logs) = result.context("Sandbox failed")?;
    if let Some(logs) = logs.filter(|l| !l.trim().is_empty()) {
        println!("--- logs ---\n{}", logs.trim_end());
    }
    if let Some(stats) = stats {
        println!(
            "--- stats ---\nmemory: {} / {} bytes, pids: {}, cpu: {} ns",
            stats.memory_usage_bytes, stats.memory_limit_bytes, stats.pids_current, stats.cpu_total_ns
        );
    }

    let output = output.context("Command failed")?;
    println!("--- output (exit {}) ---", output.exit_code);
    print!("{}", output.output);
    if output.truncated {
        println!("\n[output truncated]");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_args() {
        let cli = Cli::try_parse_from([
            "devloop",
            "run",
            "--project",
            "/tmp/p",
            "--workers",
            "3",
            "--dispatch",
            "dependencies",
            "--resume",
            "--rerun-completed",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.workers, Some(3));
        assert_eq!(args.dispatch, Some(DispatchMode::Dependencies));
        assert!(args.resume && args.rerun_completed);
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_rerun_requires_resume() {
        assert!(Cli::try_parse_from(["devloop", "run", "-p", "x", "--rerun-completed"]).is_err());
    }

    #[test]
    fn test_sandbox_exec_trailing_command() {
        let cli = Cli::try_parse_from([
            "devloop", "sandbox", "exec", "--timeout-secs", "2", "--", "sh", "-c", "echo hi",
        ])
        .unwrap();
        let Commands::Sandbox(SandboxArgs {
            command: SandboxSubcommand::Exec(args),
        }) = cli.command
        else {
            panic!("expected sandbox exec");
        };
        assert_eq!(args.timeout_secs, 2);
        assert_eq!(args.command, vec!["sh", "-c", "echo hi"]);
    }

    #[test]
    fn test_parse_task_list_yaml_and_json() {
        let yaml = "tasks:\n  - id: a\n    description: first\n    priority: 2\n  - id: b\n    description: second\n    dependencies: [a]\n";
        let tasks = parse_task_list(Path::new("plan.yaml"), yaml).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].dependencies, vec!["a".to_string()]);

        let json = r#"[{"id": "x", "description": "only"}]"#;
        let tasks = parse_task_list(Path::new("plan.JSON"), json).unwrap();
        assert_eq!(tasks[0].id, "x");

        assert!(parse_task_list(Path::new("plan.json"), "not json").is_err());
    }
}
