//! Task orchestration.
//!
//! [`TaskOrchestrator`] turns a requirements document into a validated task
//! graph, runs each task through generate, execute and analyze steps inside
//! an isolated sandbox, applies the resulting actions to project state and
//! checkpoints the outcome.

pub mod actions;
pub mod config;
pub mod engine;
pub mod report;

pub use actions::{resolve_path, Action, ActionDispatcher, RawAction, SEARCH_VARIABLE_PREFIX};
pub use config::{
    DispatchMode, OrchestratorConfig, DEFAULT_ANALYZER_TIMEOUT, DEFAULT_CHECKPOINT_DIR,
    DEFAULT_COMMAND_TIMEOUT, DEFAULT_REQUIREMENTS_FILE,
};
pub use engine::{FailedTask, TaskOrchestrator};
pub use report::{RunReport, SkippedTask, TaskFailure, TaskSuccess};
