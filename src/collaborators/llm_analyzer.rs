//! [`Analyzer`] backed by a chat-completion model.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{Analyzer, ExecutionAnalysis, ExecutionResult, Requirements};
use crate::error::AnalyzerError;
use crate::graph::Task;
use crate::llm::{GenerationRequest, LlmProvider, Message};
use crate::sandbox::resolve_environment;
use crate::utils::{extract_code, extract_json};

const REQUIREMENTS_SYSTEM_PROMPT: &str = r#"You are a software analyst. Read a requirements document and restate it as a short summary plus a list of concrete, independently checkable requirement statements.

Respond with a single JSON object:
{"summary": "...", "requirements": ["...", "..."]}"#;

const TASKS_SYSTEM_PROMPT: &str = r#"You are a technical lead breaking requirements into small programming tasks. Each task is solved by one self-contained program that is run once.

Respond with a single JSON object:
{"tasks": [{"id": "kebab-case-id", "description": "what the program must do", "dependencies": ["other-id"], "priority": 0, "execution_environment": "python"}]}

Rules:
- ids are unique and never list themselves as a dependency
- dependencies only name ids from the same list and never form a cycle
- higher priority runs first
- execution_environment is one of: python, node, ruby, bash"#;

const CODE_SYSTEM_PROMPT: &str = r#"You write complete, runnable programs. The program runs in an isolated container with no network access, a small memory limit and its working directory set to /workspace. Print progress and results to stdout. Exit non-zero on failure.

Respond with exactly one fenced code block and nothing else."#;

const RESULT_SYSTEM_PROMPT: &str = r#"You review the output of a program run and decide on follow-up actions.

Available actions:
- {"type": "FileWrite", "params": {"path": "relative/path", "content": "..."}}
- {"type": "FileRead", "params": {"path": "relative/path"}}
- {"type": "FileDelete", "params": {"path": "relative/path"}}
- {"type": "DirectoryCreate", "params": {"path": "relative/path"}}
- {"type": "WebSearch", "params": {"query": "..."}}

Paths are relative to the project directory. Respond with a single JSON object:
{"actions": [...]}
Use an empty list when nothing needs to happen."#;

/// Sampling settings for analyzer calls.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Empty uses the provider's default model.
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            temperature: 0.2,
            max_tokens: 4096,
        }
    }
}

pub struct LlmAnalyzer {
    llm_client: Arc<dyn LlmProvider>,
    config: AnalyzerConfig,
}

impl std::fmt::Debug for LlmAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmAnalyzer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct RequirementsResponse {
    #[serde(default)]
    summary: String,
    #[serde(default, alias = "items")]
    requirements: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TasksResponse {
    Wrapped { tasks: Vec<Task> },
    Bare(Vec<Task>),
}

impl LlmAnalyzer {
    pub fn new(llm_client: Arc<dyn LlmProvider>, config: AnalyzerConfig) -> Self {
        Self { llm_client, config }
    }

    pub fn with_defaults(llm_client: Arc<dyn LlmProvider>) -> Self {
        Self::new(llm_client, AnalyzerConfig::default())
    }

    async fn complete(&self, system: &str, user: String) -> Result<String, AnalyzerError> {
        let request = GenerationRequest::new(
            self.config.model.clone(),
            vec![Message::system(system), Message::user(user)],
        )
        .with_temperature(self.config.temperature)
        .with_max_tokens(self.config.max_tokens);

        let response = self.llm_client.generate(request).await?;
        let content = response
            .first_content()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| AnalyzerError::InvalidOutput("Empty LLM response".to_string()))?;
        Ok(content.to_string())
    }

    fn parse_json<T: DeserializeOwned>(content: &str) -> Result<T, AnalyzerError> {
        let json = extract_json(content).map_err(|e| {
            tracing::warn!(error = %e, "Could not extract JSON from LLM response");
            AnalyzerError::InvalidOutput(e.to_string())
        })?;
        serde_json::from_str(&json)
            .map_err(|e| AnalyzerError::InvalidOutput(format!("Invalid JSON: {}", e)))
    }
}

#[async_trait]
impl Analyzer for LlmAnalyzer {
    async fn analyze_requirements(&self, text: &str) -> Result<Requirements, AnalyzerError> {
        let content = self
            .complete(REQUIREMENTS_SYSTEM_PROMPT, text.to_string())
            .await?;
        let parsed: RequirementsResponse = Self::parse_json(&content)?;

        if parsed.summary.trim().is_empty() && parsed.requirements.is_empty() {
            return Err(AnalyzerError::InvalidOutput(
                "requirements analysis is empty".to_string(),
            ));
        }

        Ok(Requirements {
            summary: parsed.summary,
            items: parsed.requirements,
            source: text.to_string(),
        })
    }

    async fn generate_tasks(
        &self,
        requirements: &Requirements,
    ) -> Result<Vec<Task>, AnalyzerError> {
        let mut prompt = format!("Summary: {}\n\nRequirements:\n", requirements.summary);
        for item in &requirements.items {
            prompt.push_str("- ");
            prompt.push_str(item);
            prompt.push('\n');
        }

        let content = self.complete(TASKS_SYSTEM_PROMPT, prompt).await?;
        let tasks = match Self::parse_json::<TasksResponse>(&content)? {
            TasksResponse::Wrapped { tasks } | TasksResponse::Bare(tasks) => tasks,
        };
        tracing::debug!(count = tasks.len(), "Tasks generated");
        Ok(tasks)
    }

    async fn generate_code(&self, task: &Task) -> Result<String, AnalyzerError> {
        let environment = resolve_environment(&task.execution_environment);
        let prompt = format!(
            "Language: {}\nThe program is saved as {} and run with `{}`.\n\nTask ({}):\n{}",
            environment.name,
            environment.source_file,
            environment.run_command().join(" "),
            task.id,
            task.description,
        );

        let content = self.complete(CODE_SYSTEM_PROMPT, prompt).await?;
        let code = extract_code(&content, environment.name);
        if code.trim().is_empty() {
            return Err(AnalyzerError::InvalidOutput(format!(
                "no code generated for task '{}'",
                task.id
            )));
        }
        Ok(code)
    }

    async fn analyze_execution_result(
        &self,
        result: &ExecutionResult,
    ) -> Result<ExecutionAnalysis, AnalyzerError> {
        let prompt = serde_json::to_string_pretty(result)
            .map_err(|e| AnalyzerError::InvalidOutput(e.to_string()))?;
        let content = self.complete(RESULT_SYSTEM_PROMPT, prompt).await?;
        Self::parse_json(&content)
    }
}
