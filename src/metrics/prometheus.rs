//! Prometheus metric definitions, registration and export.

use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global registry for all devloop metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Finished tasks, labeled by status and execution environment.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Individual task attempts, labeled by outcome.
pub static TASK_ATTEMPTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Wall time per task including retries, labeled by environment.
pub static TASK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Sandboxed command duration, labeled by outcome.
pub static SANDBOX_COMMAND_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Analyzer calls, labeled by operation and status.
pub static ANALYZER_CALLS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Checkpoint writes, labeled by result.
pub static CHECKPOINTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Workers currently running a task.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Creates every metric and registers it with [`REGISTRY`].
///
/// Safe to call more than once; later calls leave the first registration in
/// place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if a metric definition is invalid.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let tasks_total = CounterVec::new(
        Opts::new("devloop_tasks_total", "Tasks finished, by final status"),
        &["status", "environment"],
    )?;

    let task_attempts_total = CounterVec::new(
        Opts::new("devloop_task_attempts_total", "Task attempts, by outcome"),
        &["outcome"],
    )?;

    let task_duration = HistogramVec::new(
        HistogramOpts::new(
            "devloop_task_duration_seconds",
            "Task duration in seconds, including retries",
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 900.0]),
        &["environment"],
    )?;

    let sandbox_command_duration = HistogramVec::new(
        HistogramOpts::new(
            "devloop_sandbox_command_duration_seconds",
            "Duration of commands run inside sandboxes",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        &["outcome"],
    )?;

    let analyzer_calls_total = CounterVec::new(
        Opts::new("devloop_analyzer_calls_total", "Analyzer calls"),
        &["operation", "status"],
    )?;

    let checkpoints_total = CounterVec::new(
        Opts::new("devloop_checkpoints_total", "Checkpoint writes"),
        &["result"],
    )?;

    let active_workers = Gauge::new("devloop_active_workers", "Workers running a task")?;

    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(task_attempts_total.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;
    registry.register(Box::new(sandbox_command_duration.clone()))?;
    registry.register(Box::new(analyzer_calls_total.clone()))?;
    registry.register(Box::new(checkpoints_total.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // Already-set statics mean an earlier call won
    let _ = REGISTRY.set(registry);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = TASK_ATTEMPTS_TOTAL.set(task_attempts_total);
    let _ = TASK_DURATION.set(task_duration);
    let _ = SANDBOX_COMMAND_DURATION.set(sandbox_command_duration);
    let _ = ANALYZER_CALLS_TOTAL.set(analyzer_calls_total);
    let _ = CHECKPOINTS_TOTAL.set(checkpoints_total);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::debug!("Prometheus metrics initialized");
    Ok(())
}

/// Renders all registered metrics in the Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_metrics().unwrap();
        init_metrics().unwrap();
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_export_after_recording() {
        init_metrics().unwrap();
        if let Some(tasks) = TASKS_TOTAL.get() {
            tasks.with_label_values(&["succeeded", "python"]).inc();
        }

        let text = export_metrics();
        assert!(!text.starts_with("# Error"));
        assert!(text.contains("devloop_tasks_total"));
    }
}
