//! Task definition.

use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// Identifier of a task within one run.
pub type TaskId = String;

/// Environment used when a task does not name one.
pub const DEFAULT_ENVIRONMENT: &str = "python";

fn default_environment() -> String {
    DEFAULT_ENVIRONMENT.to_string()
}

/// One unit of generated-code work.
///
/// Tasks are immutable once placed in a [`TaskGraph`](super::TaskGraph).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub priority: i32,
    #[serde(
        default = "default_environment",
        alias = "executionEnvironment",
        alias = "environment"
    )]
    pub execution_environment: String,
}

impl Task {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            dependencies: Vec::new(),
            priority: 0,
            execution_environment: default_environment(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.execution_environment = environment.into();
        self
    }

    /// Checks the shape of a task produced by an untrusted generator.
    pub fn validate(&self) -> Result<(), GraphError> {
        let invalid = |reason: &str| GraphError::InvalidTask {
            id: self.id.clone(),
            reason: reason.to_string(),
        };

        if self.id.trim().is_empty() {
            return Err(invalid("task id must not be empty"));
        }
        if self.description.trim().is_empty() {
            return Err(invalid("description must not be empty"));
        }
        if self.dependencies.iter().any(|dep| dep == &self.id) {
            return Err(invalid("task depends on itself"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_deserialize_defaults() {
        let task: Task = serde_json::from_str(r#"{"id": "t1", "description": "hello"}"#).unwrap();
        assert_eq!(task.priority, 0);
        assert!(task.dependencies.is_empty());
        assert_eq!(task.execution_environment, "python");
    }

    #[test]
    fn test_task_deserialize_camel_case_environment() {
        let task: Task = serde_json::from_str(
            r#"{"id": "t1", "description": "d", "priority": 4, "executionEnvironment": "node"}"#,
        )
        .unwrap();
        assert_eq!(task.priority, 4);
        assert_eq!(task.execution_environment, "node");
    }

    #[test]
    fn test_validate_rejects_self_dependency() {
        let task = Task::new("a", "loop").with_dependencies(["a"]);
        assert!(matches!(
            task.validate(),
            Err(GraphError::InvalidTask { ref id, .. }) if id == "a"
        ));
    }

    #[test]
    fn test_validate_rejects_blank_fields() {
        assert!(Task::new("", "desc").validate().is_err());
        assert!(Task::new("id", "   ").validate().is_err());
        assert!(Task::new("id", "desc").validate().is_ok());
    }
}
