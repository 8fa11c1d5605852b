//! Sandbox lifecycle management.
//!
//! A [`Sandbox`] owns one isolated context from a [`SandboxBackend`] and
//! tracks its state. Commands get a caller-supplied timeout; a timed-out or
//! cancelled command is killed on its own and the sandbox stays usable.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backend::{ExecOutput, SandboxBackend, SandboxSpec, SandboxStats};
use super::limits::ResourceLimits;
use crate::error::{ResourceKind, SandboxError};

/// Exit status of a process killed by SIGKILL (the OOM killer's signal).
const EXIT_SIGKILL: i64 = 128 + 9;
/// Exit status of a process killed by SIGXCPU.
const EXIT_SIGXCPU: i64 = 128 + 24;

const MEMORY_MARKERS: &[&str] = &[
    "MemoryError",
    "Cannot allocate memory",
    "out of memory",
    "JavaScript heap out of memory",
    "failed to allocate memory",
];

const PIDS_MARKERS: &[&str] = &[
    "Resource temporarily unavailable",
    "fork: retry",
    "can't fork",
    "Cannot fork",
];

/// Status of a managed sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxStatus {
    /// Not provisioned yet.
    Pending,
    /// Being provisioned.
    Provisioning,
    /// Ready to run commands.
    Running,
    /// Stopped and removed.
    Stopped,
    /// Provisioning failed with an error message.
    Failed(String),
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxStatus::Pending => write!(f, "pending"),
            SandboxStatus::Provisioning => write!(f, "provisioning"),
            SandboxStatus::Running => write!(f, "running"),
            SandboxStatus::Stopped => write!(f, "stopped"),
            SandboxStatus::Failed(msg) => write!(f, "failed: {}", msg),
        }
    }
}

/// Maps a finished command to success or a typed failure.
pub fn classify_exit(output: ExecOutput) -> Result<ExecOutput, SandboxError> {
    if output.exit_code == 0 {
        return Ok(output);
    }

    let haystack = if output.stderr.is_empty() {
        output.output.as_str()
    } else {
        output.stderr.as_str()
    };

    if output.exit_code == EXIT_SIGKILL || MEMORY_MARKERS.iter().any(|m| haystack.contains(m)) {
        return Err(SandboxError::ResourceLimitExceeded {
            resource: ResourceKind::Memory,
            detail: format!("exit code {}: {}", output.exit_code, tail(haystack)),
        });
    }
    if PIDS_MARKERS.iter().any(|m| haystack.contains(m)) {
        return Err(SandboxError::ResourceLimitExceeded {
            resource: ResourceKind::Pids,
            detail: tail(haystack),
        });
    }
    if output.exit_code == EXIT_SIGXCPU {
        return Err(SandboxError::ResourceLimitExceeded {
            resource: ResourceKind::Cpu,
            detail: format!("exit code {}", output.exit_code),
        });
    }

    Err(SandboxError::NonZeroExit {
        code: output.exit_code,
        output: output.output,
    })
}

/// Last few hundred characters of a message, for error details.
fn tail(text: &str) -> String {
    const MAX: usize = 400;
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= MAX {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - MAX).collect()
}

/// An isolated execution context with lifecycle tracking.
pub struct Sandbox {
    backend: Arc<dyn SandboxBackend>,
    spec: SandboxSpec,
    id: Option<String>,
    status: SandboxStatus,
    created_at: DateTime<Utc>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("name", &self.spec.name)
            .field("id", &self.id)
            .field("status", &self.status)
            .finish()
    }
}

impl Sandbox {
    /// Creates a sandbox handle. Nothing is provisioned until [`start`](Self::start).
    pub fn new(backend: Arc<dyn SandboxBackend>, spec: SandboxSpec) -> Self {
        Self {
            backend,
            spec,
            id: None,
            status: SandboxStatus::Pending,
            created_at: Utc::now(),
        }
    }

    /// Provisions and starts the isolated context.
    ///
    /// On failure the sandbox is left in `Failed` state; [`stop`](Self::stop)
    /// still reclaims whatever was created.
    pub async fn start(&mut self) -> Result<(), SandboxError> {
        match self.status {
            SandboxStatus::Pending => {}
            SandboxStatus::Running => return Ok(()),
            _ => {
                return Err(SandboxError::ProvisioningFailed(format!(
                    "Cannot start sandbox in {} state",
                    self.status
                )))
            }
        }

        self.status = SandboxStatus::Provisioning;

        let id = match self.backend.create(&self.spec).await {
            Ok(id) => id,
            Err(e) => {
                self.status = SandboxStatus::Failed(e.to_string());
                return Err(into_provisioning(e));
            }
        };
        self.id = Some(id.clone());

        if let Err(e) = self.backend.start(&id).await {
            self.status = SandboxStatus::Failed(e.to_string());
            return Err(into_provisioning(e));
        }

        self.status = SandboxStatus::Running;
        info!(sandbox = %self.spec.name, sandbox_id = %id, image = %self.spec.image, "Sandbox started");
        Ok(())
    }

    fn running_id(&self) -> Result<&str, SandboxError> {
        match (&self.status, &self.id) {
            (SandboxStatus::Running, Some(id)) => Ok(id),
            _ => Err(SandboxError::NotRunning {
                state: self.status.to_string(),
            }),
        }
    }

    /// Runs one command, enforcing `timeout`.
    ///
    /// On timeout or cancellation only this command's process group is killed.
    ///
    /// # Errors
    ///
    /// - `SandboxError::ExecutionTimeout` when `timeout` elapses
    /// - `SandboxError::Cancelled` when `cancel` fires
    /// - `SandboxError::ResourceLimitExceeded` or `SandboxError::NonZeroExit`
    ///   when the command fails
    pub async fn execute_command(
        &self,
        cmd: &[String],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, SandboxError> {
        let id = self.running_id()?;
        let exec_tag = Uuid::new_v4().simple().to_string();
        let started = Instant::now();

        debug!(sandbox_id = %id, exec_tag = %exec_tag, command = ?cmd, "Executing command");

        let outcome = tokio::select! {
            result = self.backend.exec(id, cmd, &exec_tag) => Some(result),
            _ = tokio::time::sleep(timeout) => None,
            _ = cancel.cancelled() => {
                self.kill(id, &exec_tag).await;
                return Err(SandboxError::Cancelled);
            }
        };

        match outcome {
            Some(result) => {
                let output = result?;
                debug!(
                    sandbox_id = %id,
                    exit_code = output.exit_code,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Command finished"
                );
                classify_exit(output)
            }
            None => {
                warn!(sandbox_id = %id, timeout_secs = timeout.as_secs_f64(), "Command timed out");
                self.kill(id, &exec_tag).await;
                Err(SandboxError::ExecutionTimeout { timeout })
            }
        }
    }

    async fn kill(&self, id: &str, exec_tag: &str) {
        if let Err(e) = self.backend.kill_exec(id, exec_tag).await {
            warn!(sandbox_id = %id, error = %e, "Failed to kill command process group");
        }
    }

    /// Stops and removes the context. Safe to call repeatedly and after a
    /// failed start.
    pub async fn stop(&mut self) -> Result<(), SandboxError> {
        let Some(id) = self.id.clone() else {
            self.status = SandboxStatus::Stopped;
            return Ok(());
        };

        if self.status == SandboxStatus::Running {
            if let Err(e) = self.backend.stop(&id).await {
                warn!(sandbox_id = %id, error = %e, "Failed to stop sandbox gracefully");
            }
        }

        self.backend.remove(&id).await?;
        self.id = None;
        self.status = SandboxStatus::Stopped;
        debug!(sandbox_id = %id, "Sandbox removed");
        Ok(())
    }

    /// Changes the ceilings; applied immediately when running.
    pub async fn update_resource_limits(
        &mut self,
        limits: ResourceLimits,
    ) -> Result<(), SandboxError> {
        limits
            .validate()
            .map_err(|reason| SandboxError::Backend(format!("Invalid limits: {reason}")))?;

        if let (SandboxStatus::Running, Some(id)) = (&self.status, &self.id) {
            self.backend.update_limits(id, &limits).await?;
            info!(
                sandbox_id = %id,
                memory_mb = limits.memory_mb,
                cpu_cores = limits.cpu_cores,
                max_processes = limits.max_processes,
                "Sandbox limits updated"
            );
        }
        self.spec.limits = limits;
        Ok(())
    }

    /// Writes bytes to a path inside the sandbox. Relative paths are resolved
    /// against the working directory.
    pub async fn write_file(&self, dest: &str, contents: &[u8]) -> Result<(), SandboxError> {
        let id = self.running_id()?;
        self.backend
            .copy_in(id, &self.resolve(dest), contents)
            .await
    }

    /// Copies a host file into the sandbox.
    pub async fn copy_in(&self, host_path: &Path, dest: &str) -> Result<(), SandboxError> {
        let contents = tokio::fs::read(host_path).await?;
        self.write_file(dest, &contents).await
    }

    /// Reads a file from inside the sandbox.
    pub async fn read_file(&self, src: &str) -> Result<Vec<u8>, SandboxError> {
        let id = self.running_id()?;
        self.backend.copy_out(id, &self.resolve(src)).await
    }

    /// Copies a file from the sandbox to the host.
    pub async fn copy_out(&self, src: &str, host_path: &Path) -> Result<(), SandboxError> {
        let contents = self.read_file(src).await?;
        if let Some(parent) = host_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(host_path, contents).await?;
        Ok(())
    }

    pub async fn logs(&self) -> Result<String, SandboxError> {
        let id = self.running_id()?;
        self.backend.logs(id).await
    }

    pub async fn stats(&self) -> Result<SandboxStats, SandboxError> {
        let id = self.running_id()?;
        self.backend.stats(id).await
    }

    fn resolve(&self, path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{}", self.spec.working_dir.trim_end_matches('/'), path)
        }
    }

    /// Returns the backend id, once provisioned.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn status(&self) -> &SandboxStatus {
        &self.status
    }

    pub fn spec(&self) -> &SandboxSpec {
        &self.spec
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.spec.limits
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_running(&self) -> bool {
        self.status == SandboxStatus::Running
    }
}

fn into_provisioning(e: SandboxError) -> SandboxError {
    match e {
        SandboxError::ProvisioningFailed(_) => e,
        other => SandboxError::ProvisioningFailed(other.to_string()),
    }
}
