//! Sandboxed execution layer.
//!
//! Runs generated code in isolated, resource-limited contexts with timeout
//! enforcement and output capture. The isolation technology sits behind
//! [`SandboxBackend`]; [`DockerBackend`] is the reference implementation.
//!
//! # Lifecycle
//!
//! ```text
//! PENDING → PROVISIONING → RUNNING → STOPPED
//!                 └──────→ FAILED ──→ STOPPED
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use devloop::sandbox::{DockerBackend, Sandbox, SandboxSpec};
//! use tokio_util::sync::CancellationToken;
//!
//! let backend = Arc::new(DockerBackend::new()?);
//! let mut sandbox = Sandbox::new(backend, SandboxSpec::new("demo", "python:3.11-slim"));
//! sandbox.start().await?;
//! let cmd = vec!["python".to_string(), "-c".to_string(), "print('hello')".to_string()];
//! let out = sandbox
//!     .execute_command(&cmd, Duration::from_secs(5), &CancellationToken::new())
//!     .await?;
//! sandbox.stop().await?;
//! ```

pub mod backend;
pub mod docker;
pub mod environment;
pub mod instance;
pub mod limits;

pub use backend::{
    ExecOutput, SandboxBackend, SandboxSpec, SandboxStats, MAX_OUTPUT_BYTES, WORKSPACE_DIR,
};
pub use docker::DockerBackend;
pub use environment::{resolve_environment, ExecutionEnvironment};
pub use instance::{classify_exit, Sandbox, SandboxStatus};
pub use limits::ResourceLimits;
