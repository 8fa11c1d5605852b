//! Project state: the single mutable artifact of a run.
//!
//! Workers never touch a `ProjectState` directly. They return a
//! [`StateChanges`] set which the orchestrator applies under its lock.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::graph::TaskId;

/// Content of one project file as last observed by the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileState {
    pub content: String,
    pub last_modified: DateTime<Utc>,
}

impl FileState {
    pub fn new(content: impl Into<String>, last_modified: DateTime<Utc>) -> Self {
        Self {
            content: content.into(),
            last_modified,
        }
    }
}

/// Resolves two versions of the same file.
///
/// The more recently modified version wins; on equal timestamps the incoming
/// version is taken.
pub fn merge_file_state(existing: &FileState, incoming: &FileState) -> FileState {
    if incoming.last_modified >= existing.last_modified {
        incoming.clone()
    } else {
        existing.clone()
    }
}

/// Durable snapshot of variables, files and completed-task history.
///
/// Serialized field names are PascalCase to match the checkpoint format.
/// Missing fields load as empty and unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ProjectState {
    pub variables: BTreeMap<String, String>,
    pub files: BTreeMap<String, FileState>,
    pub completed_tasks: Vec<TaskId>,
    pub last_executed_task: TaskId,
}

impl ProjectState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_completed(&self, task_id: &str) -> bool {
        self.completed_tasks.iter().any(|id| id == task_id)
    }

    /// Records a finished task. Completing the same task twice keeps one entry.
    pub fn mark_completed(&mut self, task_id: &str) {
        if !self.is_completed(task_id) {
            self.completed_tasks.push(task_id.to_string());
        }
        self.last_executed_task = task_id.to_string();
    }

    /// Merges a later state into this one.
    ///
    /// - variables: last writer (the incoming state) wins per key
    /// - files: [`merge_file_state`] per path
    /// - completed tasks: ordered union, existing entries first
    /// - last executed task: taken from `incoming` when it names one
    pub fn merge(&mut self, incoming: ProjectState) {
        self.variables.extend(incoming.variables);

        for (path, file) in incoming.files {
            let merged = match self.files.get(&path) {
                Some(existing) => merge_file_state(existing, &file),
                None => file,
            };
            self.files.insert(path, merged);
        }

        for task_id in incoming.completed_tasks {
            if !self.is_completed(&task_id) {
                self.completed_tasks.push(task_id);
            }
        }

        if !incoming.last_executed_task.is_empty() {
            self.last_executed_task = incoming.last_executed_task;
        }
    }

    /// Applies the effects of one task's actions.
    pub fn apply(&mut self, changes: &StateChanges) {
        for (key, value) in &changes.variables {
            self.variables.insert(key.clone(), value.clone());
        }
        for (path, file) in &changes.files {
            match file {
                Some(file) => {
                    self.files.insert(path.clone(), file.clone());
                }
                None => {
                    self.files.remove(path);
                }
            }
        }
    }
}

/// Effects of one task attempt, applied to the project state on success.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateChanges {
    /// `None` marks a deleted file.
    pub files: BTreeMap<String, Option<FileState>>,
    pub variables: BTreeMap<String, String>,
}

impl StateChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_file(&mut self, path: impl Into<String>, content: impl Into<String>) {
        self.files
            .insert(path.into(), Some(FileState::new(content, Utc::now())));
    }

    pub fn record_deletion(&mut self, path: impl Into<String>) {
        self.files.insert(path.into(), None);
    }

    pub fn set_variable(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.variables.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_mark_completed_is_idempotent() {
        let mut state = ProjectState::new();
        state.mark_completed("a");
        state.mark_completed("b");
        state.mark_completed("a");

        assert_eq!(state.completed_tasks, vec!["a", "b"]);
        assert_eq!(state.last_executed_task, "a");
    }

    #[test]
    fn test_merge_variables_last_writer_wins() {
        let mut base = ProjectState::new();
        base.variables.insert("lang".into(), "python".into());
        base.variables.insert("keep".into(), "yes".into());

        let mut incoming = ProjectState::new();
        incoming.variables.insert("lang".into(), "rust".into());

        base.merge(incoming);
        assert_eq!(base.variables["lang"], "rust");
        assert_eq!(base.variables["keep"], "yes");
    }

    #[test]
    fn test_merge_files_latest_modified_wins() {
        let mut base = ProjectState::new();
        base.files
            .insert("new.txt".into(), FileState::new("base-newer", at(10)));
        base.files
            .insert("old.txt".into(), FileState::new("base-older", at(1)));

        let mut incoming = ProjectState::new();
        incoming
            .files
            .insert("new.txt".into(), FileState::new("incoming-older", at(5)));
        incoming
            .files
            .insert("old.txt".into(), FileState::new("incoming-newer", at(2)));
        incoming
            .files
            .insert("only.txt".into(), FileState::new("fresh", at(0)));

        base.merge(incoming);
        assert_eq!(base.files["new.txt"].content, "base-newer");
        assert_eq!(base.files["old.txt"].content, "incoming-newer");
        assert_eq!(base.files["only.txt"].content, "fresh");
    }

    #[test]
    fn test_merge_file_tie_prefers_incoming() {
        let existing = FileState::new("mine", at(3));
        let incoming = FileState::new("theirs", at(3));
        assert_eq!(merge_file_state(&existing, &incoming).content, "theirs");
    }

    #[test]
    fn test_merge_completed_tasks_union() {
        let mut base = ProjectState::new();
        base.mark_completed("a");
        base.mark_completed("b");

        let mut incoming = ProjectState::new();
        incoming.mark_completed("b");
        incoming.mark_completed("c");

        base.merge(incoming);
        assert_eq!(base.completed_tasks, vec!["a", "b", "c"]);
        assert_eq!(base.last_executed_task, "c");
    }

    #[test]
    fn test_merge_keeps_last_executed_when_incoming_empty() {
        let mut base = ProjectState::new();
        base.mark_completed("a");
        base.merge(ProjectState::new());
        assert_eq!(base.last_executed_task, "a");
    }

    #[test]
    fn test_apply_changes() {
        let mut state = ProjectState::new();
        state
            .files
            .insert("stale.txt".into(), FileState::new("x", at(0)));

        let mut changes = StateChanges::new();
        changes.record_file("main.py", "print(1)");
        changes.record_deletion("stale.txt");
        changes.set_variable("search:rust", "[]");

        state.apply(&changes);
        assert_eq!(state.files["main.py"].content, "print(1)");
        assert!(!state.files.contains_key("stale.txt"));
        assert_eq!(state.variables["search:rust"], "[]");
    }

    #[test]
    fn test_serialized_field_names() {
        let mut state = ProjectState::new();
        state.mark_completed("t1");
        state
            .files
            .insert("a.txt".into(), FileState::new("hi", at(0)));

        let json = serde_json::to_value(&state).unwrap();
        assert!(json.get("Variables").is_some());
        assert!(json.get("CompletedTasks").is_some());
        assert_eq!(json["LastExecutedTask"], "t1");
        assert_eq!(json["Files"]["a.txt"]["Content"], "hi");
        assert!(json["Files"]["a.txt"]["LastModified"].is_string());
    }

    #[test]
    fn test_deserialize_ignores_unknown_and_defaults_missing() {
        let state: ProjectState = serde_json::from_str(
            r#"{"CompletedTasks": ["x"], "SchemaVersion": 7, "Extra": {"a": 1}}"#,
        )
        .unwrap();
        assert_eq!(state.completed_tasks, vec!["x"]);
        assert!(state.variables.is_empty());
        assert!(state.last_executed_task.is_empty());
    }
}
