//! Prometheus metrics for task runs and sandbox execution.
//!
//! ```ignore
//! use devloop::metrics::{export_metrics, init_metrics};
//!
//! init_metrics()?;
//! // ... run a project ...
//! std::fs::write("metrics.prom", export_metrics())?;
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{MetricsCollector, TaskStatusLabel};
pub use self::prometheus::{export_metrics, init_metrics, REGISTRY};
