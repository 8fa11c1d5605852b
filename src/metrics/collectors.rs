//! Recording helpers over the raw Prometheus metrics.
//!
//! Every method is a no-op until [`init_metrics`](super::init_metrics) has
//! run, so library code can record unconditionally.

use std::time::Duration;

use super::prometheus::{
    ACTIVE_WORKERS, ANALYZER_CALLS_TOTAL, CHECKPOINTS_TOTAL, SANDBOX_COMMAND_DURATION,
    TASKS_TOTAL, TASK_ATTEMPTS_TOTAL, TASK_DURATION,
};

/// Final status label for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatusLabel {
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl TaskStatusLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatusLabel::Succeeded => "succeeded",
            TaskStatusLabel::Failed => "failed",
            TaskStatusLabel::Skipped => "skipped",
            TaskStatusLabel::Cancelled => "cancelled",
        }
    }
}

/// Handle for recording devloop metrics.
///
/// ```ignore
/// use devloop::metrics::{init_metrics, MetricsCollector, TaskStatusLabel};
///
/// init_metrics()?;
/// let metrics = MetricsCollector::new();
/// metrics.record_task(TaskStatusLabel::Succeeded, "python", Duration::from_secs(3));
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Records a task's final status and total duration.
    pub fn record_task(&self, status: TaskStatusLabel, environment: &str, duration: Duration) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total
                .with_label_values(&[status.as_str(), environment])
                .inc();
        }
        if let Some(task_duration) = TASK_DURATION.get() {
            task_duration
                .with_label_values(&[environment])
                .observe(duration.as_secs_f64());
        }

        tracing::trace!(
            status = status.as_str(),
            environment = environment,
            duration_secs = duration.as_secs_f64(),
            "Recorded task metric"
        );
    }

    pub fn record_attempt(&self, succeeded: bool) {
        let outcome = if succeeded { "success" } else { "failure" };
        if let Some(attempts) = TASK_ATTEMPTS_TOTAL.get() {
            attempts.with_label_values(&[outcome]).inc();
        }
    }

    /// `outcome` is e.g. "success", "timeout", "nonzero_exit".
    pub fn record_sandbox_command(&self, outcome: &str, duration: Duration) {
        if let Some(histogram) = SANDBOX_COMMAND_DURATION.get() {
            histogram
                .with_label_values(&[outcome])
                .observe(duration.as_secs_f64());
        }
        tracing::trace!(
            outcome = outcome,
            duration_secs = duration.as_secs_f64(),
            "Recorded sandbox command metric"
        );
    }

    pub fn record_analyzer_call(&self, operation: &str, succeeded: bool) {
        let status = if succeeded { "success" } else { "failure" };
        if let Some(calls) = ANALYZER_CALLS_TOTAL.get() {
            calls.with_label_values(&[operation, status]).inc();
        }
    }

    pub fn record_checkpoint(&self, succeeded: bool) {
        let result = if succeeded { "success" } else { "failure" };
        if let Some(checkpoints) = CHECKPOINTS_TOTAL.get() {
            checkpoints.with_label_values(&[result]).inc();
        }
    }

    pub fn inc_active_workers(&self) {
        if let Some(active) = ACTIVE_WORKERS.get() {
            active.inc();
        }
    }

    pub fn dec_active_workers(&self) {
        if let Some(active) = ACTIVE_WORKERS.get() {
            active.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_recording_shows_up_in_export() {
        init_metrics().unwrap();
        let metrics = MetricsCollector::new();

        metrics.record_task(TaskStatusLabel::Failed, "bash", Duration::from_secs(4));
        metrics.record_attempt(false);
        metrics.record_sandbox_command("timeout", Duration::from_secs(2));
        metrics.record_analyzer_call("generate_code", true);
        metrics.record_checkpoint(true);
        metrics.inc_active_workers();
        metrics.dec_active_workers();

        let text = export_metrics();
        assert!(text.contains("devloop_task_attempts_total"));
        assert!(text.contains("outcome=\"timeout\""));
        assert!(text.contains("devloop_checkpoints_total"));
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(TaskStatusLabel::Succeeded.as_str(), "succeeded");
        assert_eq!(TaskStatusLabel::Cancelled.as_str(), "cancelled");
    }
}
