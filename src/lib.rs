//! devloop: a develop-execute-evaluate loop.
//!
//! Requirements are analyzed into a [`graph::TaskGraph`], each task's
//! generated code runs inside a resource-limited [`sandbox::Sandbox`], and
//! follow-up actions are folded into a checkpointed [`state::ProjectState`].
//! [`orchestrator::TaskOrchestrator`] ties the pieces together.

pub mod cli;
pub mod collaborators;
pub mod error;
pub mod graph;
pub mod llm;
pub mod metrics;
pub mod orchestrator;
pub mod sandbox;
pub mod scheduler;
pub mod state;
pub mod utils;

// Re-export commonly used types
pub use error::{
    ActionError, AnalyzerError, CheckpointError, ConfigError, GraphError, LlmError,
    OrchestratorError, SandboxError, SearchError, TaskError,
};
pub use graph::{Task, TaskGraph, TaskId};
pub use orchestrator::{OrchestratorConfig, RunReport, TaskOrchestrator};
pub use state::{CheckpointStore, ProjectState};
