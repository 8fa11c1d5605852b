//! Outcome of one project run.

use std::fmt::Write as _;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::config::DispatchMode;
use crate::graph::TaskId;
use crate::state::ProjectState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSuccess {
    pub task_id: TaskId,
    pub attempts: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task_id: TaskId,
    pub attempts: u32,
    pub duration_ms: u64,
    /// Display form of the last error.
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedTask {
    pub task_id: TaskId,
    pub reason: String,
}

/// Per-task results plus the state the run ended with.
///
/// Returned directly on success and carried inside
/// [`OrchestratorError::PartialFailure`](crate::error::OrchestratorError) and
/// `Cancelled` otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub dispatch_mode: DispatchMode,
    pub succeeded: Vec<TaskSuccess>,
    pub failed: Vec<TaskFailure>,
    pub skipped: Vec<SkippedTask>,
    pub cancelled: bool,
    pub checkpoint_path: Option<PathBuf>,
    /// Set when the terminal checkpoint could not be written.
    pub checkpoint_error: Option<String>,
    pub state: ProjectState,
}

impl RunReport {
    pub fn new(dispatch_mode: DispatchMode) -> Self {
        Self {
            started_at: Utc::now(),
            duration_ms: 0,
            dispatch_mode,
            succeeded: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            cancelled: false,
            checkpoint_path: None,
            checkpoint_error: None,
            state: ProjectState::new(),
        }
    }

    pub fn total_tasks(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.skipped.len()
    }

    /// No task failed and the run was not cancelled.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }

    pub fn succeeded_ids(&self) -> Vec<&str> {
        self.succeeded.iter().map(|s| s.task_id.as_str()).collect()
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Human-readable summary for terminal output.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Run {} in {:.1}s ({} dispatch): {} succeeded, {} failed, {} skipped",
            if self.cancelled { "cancelled" } else { "finished" },
            self.duration_ms as f64 / 1000.0,
            self.dispatch_mode,
            self.succeeded.len(),
            self.failed.len(),
            self.skipped.len(),
        );
        for s in &self.succeeded {
            let _ = writeln!(
                out,
                "  ok      {} ({} attempt(s), {} ms)",
                s.task_id, s.attempts, s.duration_ms
            );
        }
        for f in &self.failed {
            let _ = writeln!(
                out,
                "  FAILED  {} ({} attempt(s)): {}",
                f.task_id, f.attempts, f.error
            );
        }
        for s in &self.skipped {
            let _ = writeln!(out, "  skipped {}: {}", s.task_id, s.reason);
        }
        match (&self.checkpoint_path, &self.checkpoint_error) {
            (Some(path), _) => {
                let _ = writeln!(out, "Checkpoint: {}", path.display());
            }
            (None, Some(err)) => {
                let _ = writeln!(out, "Checkpoint NOT written: {}", err);
            }
            (None, None) => {}
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> RunReport {
        let mut report = RunReport::new(DispatchMode::Priority);
        report.succeeded.push(TaskSuccess {
            task_id: "a".into(),
            attempts: 1,
            duration_ms: 20,
        });
        report.failed.push(TaskFailure {
            task_id: "b".into(),
            attempts: 3,
            duration_ms: 3000,
            error: "exit 1".into(),
        });
        report.skipped.push(SkippedTask {
            task_id: "c".into(),
            reason: "dependency 'b' did not complete".into(),
        });
        report
    }

    #[test]
    fn test_counts() {
        let report = report();
        assert_eq!(report.total_tasks(), 3);
        assert!(!report.is_success());
        assert_eq!(report.succeeded_ids(), vec!["a"]);
        assert!(RunReport::new(DispatchMode::Priority).is_success());
    }

    #[test]
    fn test_render_text() {
        let text = report().render_text();
        assert!(text.contains("1 succeeded, 1 failed, 1 skipped"));
        assert!(text.contains("FAILED  b (3 attempt(s)): exit 1"));
        assert!(text.contains("skipped c"));
    }

    #[test]
    fn test_json_shape() {
        let json = report().to_json_pretty().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["dispatch_mode"], "priority");
        assert_eq!(value["failed"][0]["attempts"], 3);
        assert!(value["state"]["CompletedTasks"].is_array());
    }
}
