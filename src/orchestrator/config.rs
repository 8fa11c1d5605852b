//! Orchestrator configuration.
//!
//! Defaults cover a local run. [`OrchestratorConfig::from_env`] overlays
//! `DEVLOOP_*` environment variables; the CLI then overlays its flags.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::sandbox::ResourceLimits;
use crate::scheduler::{RetryPolicy, DEFAULT_NUM_WORKERS};

/// Default per-command sandbox timeout.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// Default bound on a single analyzer call.
pub const DEFAULT_ANALYZER_TIMEOUT: Duration = Duration::from_secs(120);

pub const DEFAULT_REQUIREMENTS_FILE: &str = "requirements.md";

/// Checkpoint directory, relative to the project directory.
pub const DEFAULT_CHECKPOINT_DIR: &str = ".devloop";

/// Whether the worker pool waits for declared dependencies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Descending priority; dependencies are informational only.
    #[default]
    Priority,
    /// A task runs only after its in-graph dependencies completed.
    Dependencies,
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchMode::Priority => write!(f, "priority"),
            DispatchMode::Dependencies => write!(f, "dependencies"),
        }
    }
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "priority" => Ok(DispatchMode::Priority),
            "dependencies" | "deps" => Ok(DispatchMode::Dependencies),
            other => Err(format!(
                "unknown dispatch mode '{}', expected 'priority' or 'dependencies'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub num_workers: usize,
    pub dispatch_mode: DispatchMode,
    pub retry: RetryPolicy,
    /// Bound on each sandboxed command.
    pub command_timeout: Duration,
    /// Bound on each analyzer call.
    pub analyzer_timeout: Duration,
    pub limits: ResourceLimits,
    /// Memory ceiling multiplier applied to the next attempt after an
    /// out-of-memory failure. `None` keeps limits fixed.
    pub oom_memory_multiplier: Option<f64>,
    /// Relative to the project directory.
    pub requirements_file: PathBuf,
    /// Relative to the project directory unless absolute.
    pub checkpoint_dir: PathBuf,
    /// Seed state from the latest checkpoint.
    pub resume: bool,
    /// With `resume`, run tasks already listed as completed again.
    pub rerun_completed: bool,
    /// Save a snapshot after every completed task, not only at the end.
    pub checkpoint_each_task: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            num_workers: DEFAULT_NUM_WORKERS,
            dispatch_mode: DispatchMode::default(),
            retry: RetryPolicy::default(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            analyzer_timeout: DEFAULT_ANALYZER_TIMEOUT,
            limits: ResourceLimits::default(),
            oom_memory_multiplier: None,
            requirements_file: PathBuf::from(DEFAULT_REQUIREMENTS_FILE),
            checkpoint_dir: PathBuf::from(DEFAULT_CHECKPOINT_DIR),
            resume: false,
            rerun_completed: false,
            checkpoint_each_task: false,
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from `DEVLOOP_*` environment variables.
    ///
    /// Unset variables keep their defaults:
    /// - `DEVLOOP_MAX_WORKERS` (5)
    /// - `DEVLOOP_MAX_ATTEMPTS` (3)
    /// - `DEVLOOP_BACKOFF_BASE_MS` (1000)
    /// - `DEVLOOP_COMMAND_TIMEOUT_SECS` (300)
    /// - `DEVLOOP_ANALYZER_TIMEOUT_SECS` (120)
    /// - `DEVLOOP_DISPATCH_MODE` (priority)
    /// - `DEVLOOP_REQUIREMENTS_FILE` (requirements.md)
    /// - `DEVLOOP_CHECKPOINT_DIR` (.devloop)
    /// - `DEVLOOP_MEMORY_MB`, `DEVLOOP_CPU_CORES`, `DEVLOOP_MAX_PROCESSES`
    /// - `DEVLOOP_OOM_MEMORY_MULTIPLIER` (unset)
    /// - `DEVLOOP_RESUME`, `DEVLOOP_CHECKPOINT_EACH_TASK` (false)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a value does not parse or the result fails
    /// [`validate`](Self::validate).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("DEVLOOP_MAX_WORKERS") {
            config.num_workers = parse_env_value(&val, "DEVLOOP_MAX_WORKERS")?;
        }
        if let Some(val) = lookup("DEVLOOP_MAX_ATTEMPTS") {
            config.retry.max_attempts = parse_env_value(&val, "DEVLOOP_MAX_ATTEMPTS")?;
        }
        if let Some(val) = lookup("DEVLOOP_BACKOFF_BASE_MS") {
            let ms: u64 = parse_env_value(&val, "DEVLOOP_BACKOFF_BASE_MS")?;
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(val) = lookup("DEVLOOP_COMMAND_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "DEVLOOP_COMMAND_TIMEOUT_SECS")?;
            config.command_timeout = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("DEVLOOP_ANALYZER_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "DEVLOOP_ANALYZER_TIMEOUT_SECS")?;
            config.analyzer_timeout = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("DEVLOOP_DISPATCH_MODE") {
            config.dispatch_mode = val.parse().map_err(|reason| ConfigError::InvalidValue {
                key: "DEVLOOP_DISPATCH_MODE".to_string(),
                value: val.clone(),
                reason,
            })?;
        }
        if let Some(val) = lookup("DEVLOOP_REQUIREMENTS_FILE") {
            config.requirements_file = PathBuf::from(val);
        }
        if let Some(val) = lookup("DEVLOOP_CHECKPOINT_DIR") {
            config.checkpoint_dir = PathBuf::from(val);
        }

        // Sandbox ceilings
        if let Some(val) = lookup("DEVLOOP_MEMORY_MB") {
            config.limits.memory_mb = parse_env_value(&val, "DEVLOOP_MEMORY_MB")?;
        }
        if let Some(val) = lookup("DEVLOOP_CPU_CORES") {
            config.limits.cpu_cores = parse_env_value(&val, "DEVLOOP_CPU_CORES")?;
        }
        if let Some(val) = lookup("DEVLOOP_MAX_PROCESSES") {
            config.limits.max_processes = parse_env_value(&val, "DEVLOOP_MAX_PROCESSES")?;
        }
        if let Some(val) = lookup("DEVLOOP_OOM_MEMORY_MULTIPLIER") {
            config.oom_memory_multiplier =
                Some(parse_env_value(&val, "DEVLOOP_OOM_MEMORY_MULTIPLIER")?);
        }

        if let Some(val) = lookup("DEVLOOP_RESUME") {
            config.resume = parse_env_bool(&val, "DEVLOOP_RESUME")?;
        }
        if let Some(val) = lookup("DEVLOOP_CHECKPOINT_EACH_TASK") {
            config.checkpoint_each_task = parse_env_bool(&val, "DEVLOOP_CHECKPOINT_EACH_TASK")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_workers must be greater than 0".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.command_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "command_timeout must be greater than 0".to_string(),
            ));
        }
        if self.analyzer_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "analyzer_timeout must be greater than 0".to_string(),
            ));
        }
        self.limits
            .validate()
            .map_err(ConfigError::ValidationFailed)?;

        if let Some(multiplier) = self.oom_memory_multiplier {
            if !multiplier.is_finite() || multiplier < 1.0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "oom_memory_multiplier must be at least 1.0, got {}",
                    multiplier
                )));
            }
        }
        if self.requirements_file.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "requirements_file cannot be empty".to_string(),
            ));
        }
        if self.checkpoint_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "checkpoint_dir cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.dispatch_mode = mode;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_analyzer_timeout(mut self, timeout: Duration) -> Self {
        self.analyzer_timeout = timeout;
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_oom_memory_multiplier(mut self, multiplier: f64) -> Self {
        self.oom_memory_multiplier = Some(multiplier);
        self
    }

    pub fn with_requirements_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.requirements_file = path.into();
        self
    }

    pub fn with_checkpoint_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = path.into();
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_rerun_completed(mut self, rerun: bool) -> Self {
        self.rerun_completed = rerun;
        self
    }

    pub fn with_checkpoint_each_task(mut self, enabled: bool) -> Self {
        self.checkpoint_each_task = enabled;
        self
    }
}

fn parse_env_value<T: FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: "could not parse".to_string(),
    })
}

fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}
