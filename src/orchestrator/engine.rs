//! The develop-execute-evaluate control loop.

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::actions::{Action, ActionDispatcher};
use super::config::{DispatchMode, OrchestratorConfig};
use super::report::{RunReport, SkippedTask, TaskFailure, TaskSuccess};
use crate::collaborators::{Analyzer, ExecutionResult, FileSystem, WebSearch};
use crate::error::{
    AnalyzerError, OrchestratorError, ResourceKind, SandboxError, TaskError,
};
use crate::graph::{Task, TaskGraph};
use crate::metrics::{MetricsCollector, TaskStatusLabel};
use crate::sandbox::{
    resolve_environment, ExecOutput, ExecutionEnvironment, ResourceLimits, Sandbox,
    SandboxBackend, SandboxSpec,
};
use crate::scheduler::{
    DependencyQueue, PriorityQueue, TaskQueue, WorkOutcome, WorkResult, WorkerPool,
    WorkerPoolConfig,
};
use crate::state::{CheckpointStore, ProjectState, StateChanges};

/// A task that did not complete, with the number of attempts it used.
#[derive(Debug)]
pub struct FailedTask {
    pub error: TaskError,
    pub attempts: u32,
}

/// Drives a project from requirements to executed tasks.
///
/// Each call to [`process_project`](Self::process_project) is one pass:
/// requirements are analyzed into tasks, the tasks are run by a bounded
/// worker pool with retries, and the resulting [`ProjectState`] is
/// checkpointed whether or not every task succeeded.
pub struct TaskOrchestrator {
    analyzer: Arc<dyn Analyzer>,
    fs: Arc<dyn FileSystem>,
    dispatcher: ActionDispatcher,
    backend: Arc<dyn SandboxBackend>,
    config: OrchestratorConfig,
    metrics: MetricsCollector,
}

impl TaskOrchestrator {
    pub fn new(
        analyzer: Arc<dyn Analyzer>,
        fs: Arc<dyn FileSystem>,
        search: Arc<dyn WebSearch>,
        backend: Arc<dyn SandboxBackend>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            analyzer,
            dispatcher: ActionDispatcher::new(Arc::clone(&fs), search),
            fs,
            backend,
            config,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Checkpoint store for a project directory.
    pub fn checkpoint_store(&self, project_dir: &Path) -> CheckpointStore {
        CheckpointStore::new(project_dir.join(&self.config.checkpoint_dir))
    }

    /// Runs one pass over the project in `project_dir`.
    ///
    /// # Errors
    ///
    /// Reading requirements, analysis, task validation, graph construction
    /// and resume loading fail the run before anything executes, with no
    /// checkpoint written. After that the run always checkpoints and returns
    /// a [`RunReport`], wrapped in `PartialFailure` when a task failed and in
    /// `Cancelled` when `cancel` fired.
    pub async fn process_project(
        &self,
        project_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<RunReport, OrchestratorError> {
        self.config.validate()?;
        let started = Instant::now();
        let mut report = RunReport::new(self.config.dispatch_mode);
        let store = self.checkpoint_store(project_dir);

        info!(
            project = %project_dir.display(),
            dispatch_mode = %self.config.dispatch_mode,
            workers = self.config.num_workers,
            "Processing project"
        );

        let requirements_path = project_dir.join(&self.config.requirements_file);
        let text = self
            .fs
            .read_file(&requirements_path)
            .await
            .map_err(|source| OrchestratorError::ReadRequirements {
                path: requirements_path.display().to_string(),
                source,
            })?;

        let timeout = self.config.analyzer_timeout;
        let requirements = match bounded_analyzer_call(
            "analyze_requirements",
            timeout,
            cancel,
            &self.metrics,
            self.analyzer.analyze_requirements(&text),
        )
        .await
        {
            Err(AnalyzerError::Cancelled) => return Err(cancelled_early(report, started)),
            other => other?,
        };

        let tasks = match bounded_analyzer_call(
            "generate_tasks",
            timeout,
            cancel,
            &self.metrics,
            self.analyzer.generate_tasks(&requirements),
        )
        .await
        {
            Err(AnalyzerError::Cancelled) => return Err(cancelled_early(report, started)),
            other => other?,
        };

        for task in &tasks {
            task.validate()?;
        }
        let graph = TaskGraph::build(tasks)?;
        info!(tasks = graph.len(), "Task graph built");

        let mut state = ProjectState::new();
        if self.config.resume {
            if let Some((path, loaded)) = store.load_latest_if_any().await? {
                info!(
                    path = %path.display(),
                    completed = loaded.completed_tasks.len(),
                    "Resuming from checkpoint"
                );
                state = loaded;
            }
        }

        let graph = if self.config.resume && !self.config.rerun_completed {
            let (remaining, done): (Vec<Task>, Vec<Task>) = graph
                .sort_by_priority()
                .into_iter()
                .partition(|task| !state.is_completed(&task.id));
            for task in done {
                debug!(task_id = %task.id, "Skipping task completed in an earlier run");
                report.skipped.push(SkippedTask {
                    task_id: task.id,
                    reason: "completed in an earlier run".to_string(),
                });
            }
            TaskGraph::build(remaining)?
        } else {
            graph
        };

        let state = Arc::new(Mutex::new(state));
        let ctx = Arc::new(RunContext {
            analyzer: Arc::clone(&self.analyzer),
            dispatcher: self.dispatcher.clone(),
            backend: Arc::clone(&self.backend),
            config: self.config.clone(),
            project_dir: project_dir.to_path_buf(),
            state: Arc::clone(&state),
            store: store.clone(),
            cancel: cancel.clone(),
            metrics: self.metrics,
        });

        let outcomes = match self.execute_tasks(&graph, ctx, cancel).await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                error!(error = %e, "Worker pool failed, saving state before aborting");
                let snapshot = state.lock().await.clone();
                if let Err(save_err) = store.save(&snapshot).await {
                    error!(error = %save_err, "Checkpoint after pool failure also failed");
                }
                return Err(e);
            }
        };

        collect_outcomes(&mut report, &graph, outcomes);

        let snapshot = state.lock().await.clone();
        match store.save(&snapshot).await {
            Ok(path) => {
                self.metrics.record_checkpoint(true);
                report.checkpoint_path = Some(path);
            }
            Err(e) => {
                self.metrics.record_checkpoint(false);
                error!(error = %e, "Failed to write checkpoint");
                report.checkpoint_error = Some(e.to_string());
            }
        }

        report.state = snapshot;
        report.cancelled = cancel.is_cancelled();
        report.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            cancelled = report.cancelled,
            duration_ms = report.duration_ms,
            "Project pass finished"
        );

        if report.cancelled {
            Err(OrchestratorError::Cancelled {
                report: Box::new(report),
            })
        } else if !report.failed.is_empty() {
            Err(OrchestratorError::PartialFailure {
                report: Box::new(report),
            })
        } else {
            Ok(report)
        }
    }

    /// Drains the graph through the worker pool.
    async fn execute_tasks(
        &self,
        graph: &TaskGraph,
        ctx: Arc<RunContext>,
        cancel: &CancellationToken,
    ) -> Result<Vec<WorkOutcome<u32, FailedTask>>, OrchestratorError> {
        let queue: Arc<dyn TaskQueue> = match self.config.dispatch_mode {
            DispatchMode::Priority => Arc::new(PriorityQueue::from_graph(graph)),
            DispatchMode::Dependencies => Arc::new(DependencyQueue::from_graph(graph)),
        };
        let pool = WorkerPool::new(WorkerPoolConfig::new(self.config.num_workers))?;

        let outcomes = pool
            .run(queue, cancel.clone(), move |task| {
                let ctx = Arc::clone(&ctx);
                async move { ctx.process_task(task).await }
            })
            .await?;
        Ok(outcomes)
    }
}

/// Everything a worker needs for one pass, shared across workers.
struct RunContext {
    analyzer: Arc<dyn Analyzer>,
    dispatcher: ActionDispatcher,
    backend: Arc<dyn SandboxBackend>,
    config: OrchestratorConfig,
    project_dir: PathBuf,
    state: Arc<Mutex<ProjectState>>,
    store: CheckpointStore,
    cancel: CancellationToken,
    metrics: MetricsCollector,
}

impl RunContext {
    /// Retries [`execute_task`](Self::execute_task) with backoff and applies
    /// the state changes of the attempt that succeeds.
    async fn process_task(&self, task: Task) -> Result<u32, FailedTask> {
        let started = Instant::now();
        let environment = resolve_environment(&task.execution_environment);
        let mut limits = self.config.limits;
        let mut attempts = 0u32;
        self.metrics.inc_active_workers();

        let result = loop {
            if self.cancel.is_cancelled() {
                break Err(TaskError::Cancelled {
                    task_id: task.id.clone(),
                });
            }
            attempts += 1;
            info!(task_id = %task.id, attempt = attempts, "Starting task attempt");

            let error = match self.execute_task(&task, &environment, limits).await {
                Ok(changes) => {
                    self.metrics.record_attempt(true);
                    self.commit(&task, changes).await;
                    break Ok(());
                }
                Err(e) => e,
            };
            self.metrics.record_attempt(false);

            if error.is_cancellation() {
                break Err(error);
            }
            if !error.is_retryable() {
                warn!(task_id = %task.id, attempt = attempts, error = %error, "Task failed permanently");
                break Err(error);
            }
            if !self.config.retry.should_retry(attempts) {
                break Err(TaskError::RetriesExhausted {
                    task_id: task.id.clone(),
                    attempts,
                    source: Box::new(error),
                });
            }

            if let (
                Some(multiplier),
                TaskError::Sandbox(SandboxError::ResourceLimitExceeded {
                    resource: ResourceKind::Memory,
                    ..
                }),
            ) = (self.config.oom_memory_multiplier, &error)
            {
                limits = limits.with_memory_scaled(multiplier);
                info!(task_id = %task.id, memory_mb = limits.memory_mb, "Raising memory ceiling for next attempt");
            }

            let delay = self.config.retry.delay_after(attempts);
            warn!(
                task_id = %task.id,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Task attempt failed, backing off"
            );
            if self.config.retry.backoff(attempts, &self.cancel).await.is_err() {
                break Err(TaskError::Cancelled {
                    task_id: task.id.clone(),
                });
            }
        };

        self.metrics.dec_active_workers();
        let duration = started.elapsed();

        match result {
            Ok(()) => {
                info!(task_id = %task.id, attempts = attempts, duration_ms = duration.as_millis() as u64, "Task completed");
                self.metrics
                    .record_task(TaskStatusLabel::Succeeded, environment.name, duration);
                Ok(attempts)
            }
            Err(error) => {
                let label = if error.is_cancellation() {
                    TaskStatusLabel::Cancelled
                } else {
                    error!(task_id = %task.id, attempts = attempts, error = %error, "Task failed");
                    TaskStatusLabel::Failed
                };
                self.metrics.record_task(label, environment.name, duration);
                Err(FailedTask { error, attempts })
            }
        }
    }

    /// One attempt: generate code, run it in a fresh sandbox, analyze the
    /// result and dispatch the resulting actions.
    async fn execute_task(
        &self,
        task: &Task,
        environment: &ExecutionEnvironment,
        limits: ResourceLimits,
    ) -> Result<StateChanges, TaskError> {
        let code = bounded_analyzer_call(
            "generate_code",
            self.config.analyzer_timeout,
            &self.cancel,
            &self.metrics,
            self.analyzer.generate_code(task),
        )
        .await?;

        let spec = SandboxSpec::new(sandbox_name(&task.id), environment.image).with_limits(limits);
        let mut sandbox = Sandbox::new(Arc::clone(&self.backend), spec);
        let run = self.run_in_sandbox(&mut sandbox, environment, &code).await;
        if let Err(e) = sandbox.stop().await {
            warn!(task_id = %task.id, error = %e, "Failed to clean up sandbox");
        }
        let output = run?;

        let result = ExecutionResult {
            output: output.output,
            exit_code: output.exit_code,
            error: output
                .truncated
                .then(|| "output truncated".to_string()),
        };
        let analysis = bounded_analyzer_call(
            "analyze_execution_result",
            self.config.analyzer_timeout,
            &self.cancel,
            &self.metrics,
            self.analyzer.analyze_execution_result(&result),
        )
        .await?;

        let actions = analysis
            .actions
            .into_iter()
            .map(Action::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let mut changes = StateChanges::new();
        for action in &actions {
            self.dispatcher
                .execute(action, &self.project_dir, &mut changes, &self.cancel)
                .await?;
        }
        debug!(task_id = %task.id, actions = actions.len(), "Actions dispatched");
        Ok(changes)
    }

    async fn run_in_sandbox(
        &self,
        sandbox: &mut Sandbox,
        environment: &ExecutionEnvironment,
        code: &str,
    ) -> Result<ExecOutput, SandboxError> {
        sandbox.start().await?;
        sandbox
            .write_file(environment.source_file, code.as_bytes())
            .await?;

        let started = Instant::now();
        let result = sandbox
            .execute_command(
                &environment.run_command(),
                self.config.command_timeout,
                &self.cancel,
            )
            .await;
        self.metrics
            .record_sandbox_command(command_outcome(&result), started.elapsed());
        result
    }

    /// Applies a successful attempt's changes under the state lock.
    async fn commit(&self, task: &Task, changes: StateChanges) {
        let mut state = self.state.lock().await;
        state.apply(&changes);
        state.mark_completed(&task.id);

        // Saved under the state lock so the newest snapshot is always written last
        if self.config.checkpoint_each_task {
            match self.store.save(&state).await {
                Ok(_) => self.metrics.record_checkpoint(true),
                Err(e) => {
                    self.metrics.record_checkpoint(false);
                    warn!(task_id = %task.id, error = %e, "Per-task checkpoint failed");
                }
            }
        }
    }
}

/// Bounds an analyzer call by `limit` and the run's cancellation token.
async fn bounded_analyzer_call<T, F>(
    operation: &str,
    limit: Duration,
    cancel: &CancellationToken,
    metrics: &MetricsCollector,
    call: F,
) -> Result<T, AnalyzerError>
where
    F: Future<Output = Result<T, AnalyzerError>>,
{
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AnalyzerError::Cancelled),
        outcome = tokio::time::timeout(limit, call) => outcome.unwrap_or_else(|_| {
            Err(AnalyzerError::Timeout {
                operation: operation.to_string(),
                seconds: limit.as_secs(),
            })
        }),
    };
    metrics.record_analyzer_call(operation, result.is_ok());
    result
}

fn command_outcome(result: &Result<ExecOutput, SandboxError>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(SandboxError::ExecutionTimeout { .. }) => "timeout",
        Err(SandboxError::ResourceLimitExceeded { .. }) => "resource_limit",
        Err(SandboxError::NonZeroExit { .. }) => "nonzero_exit",
        Err(SandboxError::Cancelled) => "cancelled",
        Err(_) => "error",
    }
}

/// Container-safe unique name for a task attempt.
fn sandbox_name(task_id: &str) -> String {
    let slug: String = task_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .take(40)
        .collect();
    let suffix = Uuid::new_v4().simple().to_string();
    format!("devloop-{}-{}", slug, &suffix[..8])
}

fn cancelled_early(mut report: RunReport, started: Instant) -> OrchestratorError {
    info!("Run cancelled before any task was dispatched");
    report.cancelled = true;
    report.duration_ms = started.elapsed().as_millis() as u64;
    OrchestratorError::Cancelled {
        report: Box::new(report),
    }
}

/// Sorts worker outcomes into the report. Tasks the pool never handed out
/// are recorded as skipped.
fn collect_outcomes(
    report: &mut RunReport,
    graph: &TaskGraph,
    outcomes: Vec<WorkOutcome<u32, FailedTask>>,
) {
    let mut seen = HashSet::new();

    for outcome in outcomes {
        seen.insert(outcome.task_id.clone());
        let duration_ms = outcome.duration.as_millis() as u64;

        match outcome.result {
            WorkResult::Completed(attempts) => report.succeeded.push(TaskSuccess {
                task_id: outcome.task_id,
                attempts,
                duration_ms,
            }),
            WorkResult::Failed(failed) if failed.error.is_cancellation() => {
                report.skipped.push(SkippedTask {
                    task_id: outcome.task_id,
                    reason: failed.error.to_string(),
                })
            }
            WorkResult::Failed(failed) => report.failed.push(TaskFailure {
                task_id: outcome.task_id,
                attempts: failed.attempts,
                duration_ms,
                error: failed.error.to_string(),
            }),
            WorkResult::Skipped { failed_dependency } => {
                let error = TaskError::DependencyFailed {
                    task_id: outcome.task_id.clone(),
                    dependency: failed_dependency,
                };
                report.skipped.push(SkippedTask {
                    task_id: outcome.task_id,
                    reason: error.to_string(),
                });
            }
        }
    }

    for task_id in graph.task_ids() {
        if !seen.contains(task_id) {
            report.skipped.push(SkippedTask {
                task_id: task_id.clone(),
                reason: "not dispatched: run cancelled".to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(task_id: &str, result: WorkResult<u32, FailedTask>) -> WorkOutcome<u32, FailedTask> {
        WorkOutcome {
            task_id: task_id.to_string(),
            worker_id: "worker-0".to_string(),
            result,
            duration: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_sandbox_name_is_container_safe() {
        let name = sandbox_name("Build API/v2 (fast)");
        assert!(name.starts_with("devloop-build-api-v2--fast--"));
        assert!(name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'));
        assert_ne!(sandbox_name("a"), sandbox_name("a"));
    }

    #[test]
    fn test_command_outcome_labels() {
        assert_eq!(command_outcome(&Ok(ExecOutput::default())), "success");
        assert_eq!(
            command_outcome(&Err(SandboxError::ExecutionTimeout {
                timeout: Duration::from_secs(1)
            })),
            "timeout"
        );
        assert_eq!(command_outcome(&Err(SandboxError::Cancelled)), "cancelled");
    }

    #[test]
    fn test_collect_outcomes_sorts_results() {
        let graph = TaskGraph::build(vec![
            Task::new("ok", "x"),
            Task::new("bad", "x"),
            Task::new("cancelled", "x"),
            Task::new("dep", "x").with_dependencies(["bad"]),
            Task::new("never", "x"),
        ])
        .unwrap();

        let outcomes = vec![
            outcome("ok", WorkResult::Completed(2)),
            outcome(
                "bad",
                WorkResult::Failed(FailedTask {
                    error: TaskError::from(AnalyzerError::InvalidOutput("x".into())),
                    attempts: 3,
                }),
            ),
            outcome(
                "cancelled",
                WorkResult::Failed(FailedTask {
                    error: TaskError::Cancelled {
                        task_id: "cancelled".into(),
                    },
                    attempts: 1,
                }),
            ),
            outcome(
                "dep",
                WorkResult::Skipped {
                    failed_dependency: "bad".into(),
                },
            ),
        ];

        let mut report = RunReport::new(DispatchMode::Dependencies);
        collect_outcomes(&mut report, &graph, outcomes);

        assert_eq!(report.succeeded_ids(), vec!["ok"]);
        assert_eq!(report.succeeded[0].attempts, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].attempts, 3);

        let skipped: Vec<&str> = report.skipped.iter().map(|s| s.task_id.as_str()).collect();
        assert_eq!(skipped, vec!["cancelled", "dep", "never"]);
        assert!(report.skipped[1].reason.contains("dependency 'bad'"));
        assert!(report.skipped[2].reason.contains("not dispatched"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_call_times_out() {
        let result: Result<(), AnalyzerError> = bounded_analyzer_call(
            "generate_code",
            Duration::from_secs(5),
            &CancellationToken::new(),
            &MetricsCollector::new(),
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            },
        )
        .await;
        assert!(matches!(
            result,
            Err(AnalyzerError::Timeout { seconds: 5, .. })
        ));
    }

    #[tokio::test]
    async fn test_bounded_call_observes_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), AnalyzerError> = bounded_analyzer_call(
            "generate_tasks",
            Duration::from_secs(5),
            &cancel,
            &MetricsCollector::new(),
            std::future::pending(),
        )
        .await;
        assert!(matches!(result, Err(AnalyzerError::Cancelled)));
    }
}
