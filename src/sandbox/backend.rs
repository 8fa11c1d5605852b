//! Isolation backend abstraction.
//!
//! The orchestrator only talks to [`Sandbox`](super::Sandbox), which drives a
//! `SandboxBackend`. Any backend that offers process isolation with memory,
//! CPU and pid ceilings can implement this trait; [`DockerBackend`] is the
//! reference implementation.
//!
//! [`DockerBackend`]: super::DockerBackend

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::limits::ResourceLimits;
use crate::error::SandboxError;

/// Maximum bytes of captured output kept per command.
pub const MAX_OUTPUT_BYTES: usize = 512 * 1024;

/// Working directory inside every sandbox.
pub const WORKSPACE_DIR: &str = "/workspace";

/// Everything a backend needs to provision one sandbox.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Name for the isolated context; must be unique per backend.
    pub name: String,
    /// Image providing the root filesystem and interpreter.
    pub image: String,
    /// Environment variables in `KEY=value` form.
    pub env: Vec<String>,
    /// Working directory for commands.
    pub working_dir: String,
    /// Resource ceilings.
    pub limits: ResourceLimits,
    /// User to run as (e.g., "1000:1000"). `None` keeps the image default.
    pub user: Option<String>,
    /// Network access. Off unless explicitly enabled.
    pub network_enabled: bool,
}

impl SandboxSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            env: Vec::new(),
            working_dir: WORKSPACE_DIR.to_string(),
            limits: ResourceLimits::default(),
            user: None,
            network_enabled: false,
        }
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_network(mut self, enabled: bool) -> Self {
        self.network_enabled = enabled;
        self
    }
}

/// Captured result of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i64,
    /// Interleaved stdout and stderr, in arrival order.
    pub output: String,
    /// Stderr alone, used to classify failures.
    pub stderr: String,
    /// Whether output was cut at [`MAX_OUTPUT_BYTES`].
    pub truncated: bool,
}

impl ExecOutput {
    pub fn push_stdout(&mut self, chunk: &str) {
        self.truncated |= append_capped(&mut self.output, chunk);
    }

    pub fn push_stderr(&mut self, chunk: &str) {
        self.truncated |= append_capped(&mut self.stderr, chunk);
        self.truncated |= append_capped(&mut self.output, chunk);
    }
}

/// Appends as much of `chunk` as fits under [`MAX_OUTPUT_BYTES`], cut on a
/// char boundary. Returns true if anything was dropped.
fn append_capped(buf: &mut String, chunk: &str) -> bool {
    let room = MAX_OUTPUT_BYTES.saturating_sub(buf.len());
    if chunk.len() <= room {
        buf.push_str(chunk);
        return false;
    }

    let mut end = room;
    while !chunk.is_char_boundary(end) {
        end -= 1;
    }
    buf.push_str(&chunk[..end]);
    true
}

/// Point-in-time resource usage of a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxStats {
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    /// Cumulative CPU time in nanoseconds.
    pub cpu_total_ns: u64,
    pub pids_current: u64,
}

/// Operations an isolation backend must provide.
///
/// `exec` runs one command and must give the process tree an identity that
/// `kill_exec` can terminate without touching the rest of the sandbox.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Provisions an isolated context and returns its id.
    async fn create(&self, spec: &SandboxSpec) -> Result<String, SandboxError>;

    async fn start(&self, id: &str) -> Result<(), SandboxError>;

    /// Runs `cmd` to completion. `exec_tag` identifies this command for `kill_exec`.
    async fn exec(&self, id: &str, cmd: &[String], exec_tag: &str)
        -> Result<ExecOutput, SandboxError>;

    /// Kills the process tree started by the `exec` call tagged `exec_tag`.
    async fn kill_exec(&self, id: &str, exec_tag: &str) -> Result<(), SandboxError>;

    async fn stop(&self, id: &str) -> Result<(), SandboxError>;

    /// Removes the context and everything in it, even if still running.
    async fn remove(&self, id: &str) -> Result<(), SandboxError>;

    async fn update_limits(&self, id: &str, limits: &ResourceLimits) -> Result<(), SandboxError>;

    /// Writes `contents` to the absolute path `dest` inside the sandbox.
    async fn copy_in(&self, id: &str, dest: &str, contents: &[u8]) -> Result<(), SandboxError>;

    /// Reads the file at the absolute path `src` inside the sandbox.
    async fn copy_out(&self, id: &str, src: &str) -> Result<Vec<u8>, SandboxError>;

    async fn logs(&self, id: &str) -> Result<String, SandboxError>;

    async fn stats(&self, id: &str) -> Result<SandboxStats, SandboxError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_defaults_are_isolated() {
        let spec = SandboxSpec::new("sbx", "python:3.11-slim");
        assert!(!spec.network_enabled);
        assert_eq!(spec.working_dir, "/workspace");
        assert_eq!(spec.limits, ResourceLimits::default());
        assert!(spec.user.is_none());
    }

    #[test]
    fn test_spec_builder() {
        let spec = SandboxSpec::new("sbx", "node:20-slim")
            .with_limits(ResourceLimits::new(1024, 1.0, 20))
            .with_env(vec!["FOO=bar".to_string()])
            .with_user("1000:1000")
            .with_working_dir("/app")
            .with_network(true);

        assert_eq!(spec.limits.memory_mb, 1024);
        assert_eq!(spec.env, vec!["FOO=bar"]);
        assert_eq!(spec.user.as_deref(), Some("1000:1000"));
        assert_eq!(spec.working_dir, "/app");
        assert!(spec.network_enabled);
    }

    #[test]
    fn test_exec_output_interleaves_and_truncates() {
        let mut out = ExecOutput::default();
        out.push_stdout("hello ");
        out.push_stderr("oops");
        assert_eq!(out.output, "hello oops");
        assert_eq!(out.stderr, "oops");
        assert!(!out.truncated);

        let big = "x".repeat(MAX_OUTPUT_BYTES);
        out.push_stdout(&big);
        assert!(out.truncated);
        assert_eq!(out.output.len(), MAX_OUTPUT_BYTES);
        assert!(out.output.starts_with("hello oopsxxx"));

        // Full buffer: later small chunks are dropped too
        out.push_stdout("tail");
        assert_eq!(out.output.len(), MAX_OUTPUT_BYTES);
        assert!(!out.output.ends_with("tail"));
    }

    #[test]
    fn test_truncation_keeps_prefix_on_char_boundary() {
        let mut out = ExecOutput::default();
        out.push_stdout(&"a".repeat(MAX_OUTPUT_BYTES - 1));
        out.push_stdout("é!");
        assert!(out.truncated);
        assert_eq!(out.output.len(), MAX_OUTPUT_BYTES - 1);
        assert!(out.output.ends_with('a'));
    }

    #[test]
    fn test_stderr_truncation_is_flagged() {
        let mut out = ExecOutput::default();
        out.push_stderr(&"e".repeat(MAX_OUTPUT_BYTES + 10));
        assert!(out.truncated);
        assert_eq!(out.stderr.len(), MAX_OUTPUT_BYTES);
        assert_eq!(out.output.len(), MAX_OUTPUT_BYTES);
    }
}
