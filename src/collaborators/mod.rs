//! Narrow interfaces to the services the orchestrator depends on.
//!
//! - [`Analyzer`]: turns requirements into tasks, tasks into code, and
//!   execution results into follow-up actions
//! - [`FileSystem`]: reads and writes project files
//! - [`WebSearch`]: answers search queries raised by actions
//!
//! Each trait has a reference implementation here. Tests substitute
//! in-memory fakes.

pub mod fs;
pub mod llm_analyzer;
pub mod search;

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{AnalyzerError, SearchError};
use crate::graph::Task;
use crate::orchestrator::RawAction;

pub use fs::LocalFileSystem;
pub use llm_analyzer::{AnalyzerConfig, LlmAnalyzer};
pub use search::{DisabledSearch, HttpSearchClient};

/// Structured form of a requirements document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub summary: String,
    /// Individual requirement statements.
    #[serde(default)]
    pub items: Vec<String>,
    /// The text the analysis was derived from.
    #[serde(default)]
    pub source: String,
}

/// What a sandboxed command produced, as shown to the analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub output: String,
    pub exit_code: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Follow-up work the analyzer derived from an execution result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionAnalysis {
    #[serde(default)]
    pub actions: Vec<RawAction>,
}

/// One web search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
}

/// Requirement analysis and code generation.
///
/// Output is untrusted: callers bound every call with a timeout and validate
/// what comes back.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze_requirements(&self, text: &str) -> Result<Requirements, AnalyzerError>;

    async fn generate_tasks(&self, requirements: &Requirements)
        -> Result<Vec<Task>, AnalyzerError>;

    /// Source code for `task`, in the language of its execution environment.
    async fn generate_code(&self, task: &Task) -> Result<String, AnalyzerError>;

    async fn analyze_execution_result(
        &self,
        result: &ExecutionResult,
    ) -> Result<ExecutionAnalysis, AnalyzerError>;
}

/// File operations on already-resolved paths.
#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn read_file(&self, path: &Path) -> std::io::Result<String>;

    /// Writes `content`, creating parent directories, and applies `mode`.
    async fn write_file(&self, path: &Path, content: &str, mode: u32) -> std::io::Result<()>;

    async fn delete_file(&self, path: &Path) -> std::io::Result<()>;

    async fn create_directory(&self, path: &Path) -> std::io::Result<()>;
}

#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, SearchError>;
}
