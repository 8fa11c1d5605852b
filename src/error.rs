//! Error types for devloop operations.
//!
//! Defines error types for the major subsystems:
//! - Task graph construction
//! - Sandboxed command execution
//! - Project state checkpoints
//! - Analyzer and LLM interactions
//! - Action dispatch
//! - Task execution and whole-project runs

use std::time::Duration;

use thiserror::Error;

use crate::orchestrator::RunReport;
use crate::scheduler::PoolError;

/// Errors raised while building a task graph.
///
/// Construction errors are fatal: no graph is returned and nothing runs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Task '{0}' appears more than once in the task list")]
    DuplicateTask(String),

    #[error("Cyclic dependency detected: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Invalid task '{id}': {reason}")]
    InvalidTask { id: String, reason: String },
}

/// Resource whose ceiling a sandboxed command ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Memory,
    Cpu,
    Pids,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Memory => write!(f, "memory"),
            ResourceKind::Cpu => write!(f, "cpu"),
            ResourceKind::Pids => write!(f, "pids"),
        }
    }
}

/// Errors surfaced by the execution sandbox.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Command timed out after {timeout:?}")]
    ExecutionTimeout { timeout: Duration },

    #[error("Resource limit exceeded ({resource}): {detail}")]
    ResourceLimitExceeded {
        resource: ResourceKind,
        detail: String,
    },

    #[error("Command exited with code {code}: {output}")]
    NonZeroExit { code: i64, output: String },

    #[error("Sandbox provisioning failed: {0}")]
    ProvisioningFailed(String),

    #[error("Sandbox is not running (state: {state})")]
    NotRunning { state: String },

    #[error("Sandbox backend error: {0}")]
    Backend(String),

    #[error("Copy failed: {0}")]
    CopyFailed(String),

    #[error("Sandbox command cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Whether a fresh attempt could plausibly succeed.
    ///
    /// An unavailable isolation backend will not come back between retries,
    /// and a cancelled run must not be retried at all.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            SandboxError::ProvisioningFailed(_) | SandboxError::Cancelled
        )
    }
}

/// Errors that can occur while saving or loading checkpoints.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("No checkpoint found in {dir}")]
    NotFound { dir: String },

    #[error("Failed to access checkpoint '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Checkpoint '{path}' is not valid JSON: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key: LITELLM_API_KEY environment variable not set")]
    MissingApiKey,

    #[error("Missing API base URL: LITELLM_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },
}

/// Errors returned by the requirements analyzer and code generator.
#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Analyzer returned invalid output: {0}")]
    InvalidOutput(String),

    #[error("Analyzer call '{operation}' timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("Analyzer unavailable: {0}")]
    Unavailable(String),

    #[error("Analyzer call cancelled")]
    Cancelled,
}

/// Errors returned by the web search collaborator.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("Web search is not configured")]
    Disabled,

    #[error("Search request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse search response: {0}")]
    ParseError(String),
}

/// Errors raised while converting or dispatching an action.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("Unknown action type '{0}'")]
    UnknownActionType(String),

    #[error("Invalid parameters for {action_type} action: {reason}")]
    InvalidParams { action_type: String, reason: String },

    #[error("Path '{path}' escapes the project directory")]
    UnsafePath { path: String },

    #[error("File operation on '{path}' failed: {source}")]
    FileIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Web search failed: {0}")]
    Search(#[from] SearchError),

    #[error("Action cancelled")]
    Cancelled,
}

/// Errors from a single task, either one attempt or the whole retry loop.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Analyzer failed: {0}")]
    Analyzer(#[from] AnalyzerError),

    #[error("Sandbox failed: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Action failed: {0}")]
    Action(#[from] ActionError),

    #[error("Task '{task_id}' failed after {attempts} attempts (retries exhausted): {source}")]
    RetriesExhausted {
        task_id: String,
        attempts: u32,
        #[source]
        source: Box<TaskError>,
    },

    #[error("Task '{task_id}' skipped: dependency '{dependency}' did not complete")]
    DependencyFailed { task_id: String, dependency: String },

    #[error("Task '{task_id}' cancelled")]
    Cancelled { task_id: String },
}

impl TaskError {
    /// Whether the retry loop should make another attempt after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            TaskError::Sandbox(e) => e.is_retryable(),
            TaskError::Action(ActionError::Cancelled)
            | TaskError::Analyzer(AnalyzerError::Cancelled) => false,
            TaskError::Analyzer(_) | TaskError::Action(_) => true,
            TaskError::RetriesExhausted { .. }
            | TaskError::DependencyFailed { .. }
            | TaskError::Cancelled { .. } => false,
        }
    }

    /// Whether this error came from run cancellation rather than a task fault.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            TaskError::Cancelled { .. }
                | TaskError::Sandbox(SandboxError::Cancelled)
                | TaskError::Action(ActionError::Cancelled)
                | TaskError::Analyzer(AnalyzerError::Cancelled)
        )
    }
}

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Errors returned by a whole project run.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Failed to read requirements from '{path}': {source}")]
    ReadRequirements {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Requirements analysis failed: {0}")]
    Analyzer(#[from] AnalyzerError),

    #[error("Task graph construction failed: {0}")]
    Graph(#[from] GraphError),

    #[error("Failed to load checkpoint for resume: {0}")]
    Resume(#[from] CheckpointError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Worker pool failed: {0}")]
    Pool(#[from] PoolError),

    #[error("{} of {} tasks failed", .report.failed.len(), .report.total_tasks())]
    PartialFailure { report: Box<RunReport> },

    #[error("Run cancelled after {} completed tasks", .report.succeeded.len())]
    Cancelled { report: Box<RunReport> },
}

impl OrchestratorError {
    /// The best-effort report, when the run got far enough to produce one.
    pub fn report(&self) -> Option<&RunReport> {
        match self {
            OrchestratorError::PartialFailure { report } | OrchestratorError::Cancelled { report } => {
                Some(report)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_names_path() {
        let err = GraphError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Cyclic dependency detected: a -> b -> a");
    }

    #[test]
    fn test_sandbox_retryability() {
        assert!(SandboxError::ExecutionTimeout {
            timeout: Duration::from_secs(2)
        }
        .is_retryable());
        assert!(SandboxError::ResourceLimitExceeded {
            resource: ResourceKind::Memory,
            detail: "oom".into()
        }
        .is_retryable());
        assert!(SandboxError::NonZeroExit {
            code: 1,
            output: String::new()
        }
        .is_retryable());
        assert!(!SandboxError::ProvisioningFailed("no daemon".into()).is_retryable());
        assert!(!SandboxError::Cancelled.is_retryable());
    }

    #[test]
    fn test_task_error_retryability() {
        let provisioning = TaskError::from(SandboxError::ProvisioningFailed("down".into()));
        assert!(!provisioning.is_retryable());

        let analyzer = TaskError::from(AnalyzerError::InvalidOutput("garbage".into()));
        assert!(analyzer.is_retryable());

        let cancelled = TaskError::from(SandboxError::Cancelled);
        assert!(cancelled.is_cancellation());
        assert!(!cancelled.is_retryable());
    }

    #[test]
    fn test_retries_exhausted_names_task() {
        let err = TaskError::RetriesExhausted {
            task_id: "build-api".into(),
            attempts: 3,
            source: Box::new(TaskError::from(SandboxError::NonZeroExit {
                code: 2,
                output: "boom".into(),
            })),
        };
        let message = err.to_string();
        assert!(message.contains("build-api"));
        assert!(message.contains("3 attempts"));
        assert!(message.contains("retries exhausted"));
    }
}
