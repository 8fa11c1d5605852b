//! Docker sandbox backend using the bollard crate.
//!
//! Each sandbox is one long-lived container (`tail -f /dev/null` under
//! docker-init) with hard cgroup ceilings, no network and all capabilities
//! dropped. Commands run through `docker exec` inside a fresh process group
//! whose id is written to a pid file, so a timed-out command can be killed
//! without stopping the container.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, Stats, StatsOptions, StopContainerOptions,
    UpdateContainerOptions, UploadToContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::backend::{ExecOutput, SandboxBackend, SandboxSpec, SandboxStats};
use super::limits::ResourceLimits;
use crate::error::SandboxError;

/// Pid file holding the process group id of a tagged command.
fn pid_file(exec_tag: &str) -> String {
    format!("/tmp/.devloop-exec-{exec_tag}.pid")
}

/// Wraps `cmd` so it runs as its own session and records the group id.
///
/// The wrapping shell stays the group leader, so killing the group takes the
/// whole tree down while the exit status of `cmd` is passed through.
pub fn wrap_command(cmd: &[String], exec_tag: &str) -> Vec<String> {
    let pid_file = pid_file(exec_tag);
    let script = format!("echo $$ > {pid_file}; \"$@\"; rc=$?; rm -f {pid_file}; exit $rc");

    let mut wrapped = vec![
        "setsid".to_string(),
        "-w".to_string(),
        "sh".to_string(),
        "-c".to_string(),
        script,
        "sh".to_string(),
    ];
    wrapped.extend(cmd.iter().cloned());
    wrapped
}

/// Shell command that kills the process group of a tagged command.
pub fn kill_command(exec_tag: &str) -> Vec<String> {
    let pid_file = pid_file(exec_tag);
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!(
            "if [ -f {pid_file} ]; then kill -KILL -- -$(cat {pid_file}) 2>/dev/null; rm -f {pid_file}; fi"
        ),
    ]
}

fn is_status(e: &BollardError, codes: &[u16]) -> bool {
    matches!(
        e,
        BollardError::DockerResponseServerError { status_code, .. } if codes.contains(status_code)
    )
}

fn backend_error(context: &str, e: BollardError) -> SandboxError {
    SandboxError::Backend(format!("{context}: {e}"))
}

/// Builds the host configuration carrying the sandbox ceilings.
pub fn host_config(spec: &SandboxSpec) -> HostConfig {
    let limits = &spec.limits;
    HostConfig {
        memory: Some(limits.memory_bytes()),
        // Equal to memory: no swap on top of the ceiling
        memory_swap: Some(limits.memory_bytes()),
        cpu_period: Some(limits.cpu_period()),
        cpu_quota: Some(limits.cpu_quota()),
        pids_limit: Some(limits.max_processes as i64),
        network_mode: Some(if spec.network_enabled {
            "bridge".to_string()
        } else {
            "none".to_string()
        }),
        privileged: Some(false),
        cap_drop: Some(vec!["ALL".to_string()]),
        security_opt: Some(vec!["no-new-privileges:true".to_string()]),
        init: Some(true),
        ..Default::default()
    }
}

/// Sandbox backend over the local Docker daemon.
pub struct DockerBackend {
    docker: Docker,
}

impl DockerBackend {
    /// Connects to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::ProvisioningFailed` if the daemon is not reachable.
    pub fn new() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            SandboxError::ProvisioningFailed(format!("Failed to connect to Docker: {e}"))
        })?;
        Ok(Self { docker })
    }

    /// Creates a backend from an existing bollard Docker instance.
    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }

    /// Verifies the daemon answers.
    pub async fn ping(&self) -> Result<(), SandboxError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::ProvisioningFailed(format!("Docker daemon unavailable: {e}")))
    }

    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!(image = image, "Pulling sandbox image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| {
                SandboxError::ProvisioningFailed(format!("Failed to pull image {image}: {e}"))
            })?;
        }
        Ok(())
    }

    /// Runs a command and collects its output without any wrapping.
    async fn exec_raw(&self, id: &str, cmd: Vec<String>) -> Result<ExecOutput, SandboxError> {
        let exec_options = CreateExecOptions {
            cmd: Some(cmd),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(id, exec_options)
            .await
            .map_err(|e| backend_error("Failed to create exec", e))?;

        let start_result = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| backend_error("Failed to start exec", e))?;

        let mut result = ExecOutput::default();

        match start_result {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(LogOutput::StdOut { message }) => {
                            result.push_stdout(&String::from_utf8_lossy(&message));
                        }
                        Ok(LogOutput::StdErr { message }) => {
                            result.push_stderr(&String::from_utf8_lossy(&message));
                        }
                        Ok(_) => {}
                        Err(e) => return Err(backend_error("Error reading output", e)),
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(SandboxError::Backend(
                    "Unexpected detached execution".to_string(),
                ));
            }
        }

        let exec_info = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| backend_error("Failed to inspect exec", e))?;

        result.exit_code = exec_info.exit_code.unwrap_or(-1);
        Ok(result)
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    async fn create(&self, spec: &SandboxSpec) -> Result<String, SandboxError> {
        self.ensure_image(&spec.image).await?;

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(vec![
                "tail".to_string(),
                "-f".to_string(),
                "/dev/null".to_string(),
            ]),
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            working_dir: Some(spec.working_dir.clone()),
            user: spec.user.clone(),
            network_disabled: Some(!spec.network_enabled),
            host_config: Some(host_config(spec)),
            tty: Some(false),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| {
                SandboxError::ProvisioningFailed(format!("Failed to create container: {e}"))
            })?;

        debug!(container_id = %response.id, name = %spec.name, "Sandbox container created");
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<(), SandboxError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| {
                SandboxError::ProvisioningFailed(format!("Failed to start container: {e}"))
            })
    }

    async fn exec(
        &self,
        id: &str,
        cmd: &[String],
        exec_tag: &str,
    ) -> Result<ExecOutput, SandboxError> {
        self.exec_raw(id, wrap_command(cmd, exec_tag)).await
    }

    async fn kill_exec(&self, id: &str, exec_tag: &str) -> Result<(), SandboxError> {
        let result = self.exec_raw(id, kill_command(exec_tag)).await?;
        if result.exit_code != 0 {
            warn!(
                container_id = id,
                exec_tag = exec_tag,
                exit_code = result.exit_code,
                "Kill command returned non-zero"
            );
        }
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<(), SandboxError> {
        match self
            .docker
            .stop_container(id, Some(StopContainerOptions { t: 5 }))
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped, 404: already gone
            Err(e) if is_status(&e, &[304, 404]) => Ok(()),
            Err(e) => Err(backend_error("Failed to stop container", e)),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), SandboxError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, &[404]) => Ok(()),
            Err(e) => Err(backend_error("Failed to remove container", e)),
        }
    }

    async fn update_limits(&self, id: &str, limits: &ResourceLimits) -> Result<(), SandboxError> {
        let options = UpdateContainerOptions::<String> {
            memory: Some(limits.memory_bytes()),
            memory_swap: Some(limits.memory_bytes()),
            cpu_period: Some(limits.cpu_period()),
            cpu_quota: Some(limits.cpu_quota()),
            pids_limit: Some(limits.max_processes as i64),
            ..Default::default()
        };

        self.docker
            .update_container(id, options)
            .await
            .map_err(|e| backend_error("Failed to update container limits", e))
    }

    async fn copy_in(&self, id: &str, dest: &str, contents: &[u8]) -> Result<(), SandboxError> {
        let entry_path = dest.trim_start_matches('/');
        if entry_path.is_empty() {
            return Err(SandboxError::CopyFailed(format!(
                "Invalid destination path '{dest}'"
            )));
        }

        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
        header.set_cksum();

        let mut archive = tar::Builder::new(Vec::new());
        archive
            .append_data(&mut header, entry_path, contents)
            .map_err(|e| SandboxError::CopyFailed(format!("Failed to build archive: {e}")))?;
        let tarball = archive
            .into_inner()
            .map_err(|e| SandboxError::CopyFailed(format!("Failed to finish archive: {e}")))?;

        let options = UploadToContainerOptions {
            path: "/".to_string(),
            ..Default::default()
        };

        self.docker
            .upload_to_container(id, Some(options), tarball.into())
            .await
            .map_err(|e| SandboxError::CopyFailed(format!("Failed to upload {dest}: {e}")))
    }

    async fn copy_out(&self, id: &str, src: &str) -> Result<Vec<u8>, SandboxError> {
        let options = DownloadFromContainerOptions {
            path: src.to_string(),
        };

        let mut stream = self.docker.download_from_container(id, Some(options));
        let mut tarball = Vec::new();
        while let Some(chunk) = stream.next().await {
            let bytes =
                chunk.map_err(|e| SandboxError::CopyFailed(format!("Failed to download {src}: {e}")))?;
            tarball.extend_from_slice(&bytes);
        }

        let mut archive = tar::Archive::new(tarball.as_slice());
        let entries = archive
            .entries()
            .map_err(|e| SandboxError::CopyFailed(format!("Invalid archive for {src}: {e}")))?;

        for entry in entries {
            let mut entry =
                entry.map_err(|e| SandboxError::CopyFailed(format!("Invalid archive entry: {e}")))?;
            if entry.header().entry_type().is_file() {
                let mut contents = Vec::new();
                std::io::Read::read_to_end(&mut entry, &mut contents)?;
                return Ok(contents);
            }
        }

        Err(SandboxError::CopyFailed(format!("'{src}' is not a regular file")))
    }

    async fn logs(&self, id: &str) -> Result<String, SandboxError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            timestamps: false,
            ..Default::default()
        };

        let mut logs = self.docker.logs(id, Some(options));
        let mut output = String::new();

        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::StdErr { message }) => {
                    output.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => return Err(backend_error("Error reading logs", e)),
            }
        }

        Ok(output)
    }

    async fn stats(&self, id: &str) -> Result<SandboxStats, SandboxError> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };

        let mut stream = self.docker.stats(id, Some(options));
        let stats: Stats = match stream.next().await {
            Some(result) => result.map_err(|e| backend_error("Failed to read stats", e))?,
            None => {
                return Err(SandboxError::Backend(
                    "Stats stream ended without data".to_string(),
                ))
            }
        };

        Ok(SandboxStats {
            memory_usage_bytes: stats.memory_stats.usage.unwrap_or(0),
            memory_limit_bytes: stats.memory_stats.limit.unwrap_or(0),
            cpu_total_ns: stats.cpu_stats.cpu_usage.total_usage,
            pids_current: stats.pids_stats.current.unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_config_enforces_isolation() {
        let spec = SandboxSpec::new("sbx-1", "python:3.11-slim");
        let config = host_config(&spec);

        assert_eq!(config.memory, Some(256 * 1024 * 1024));
        assert_eq!(config.memory_swap, config.memory);
        assert_eq!(config.cpu_quota, Some(50_000));
        assert_eq!(config.cpu_period, Some(100_000));
        assert_eq!(config.pids_limit, Some(100));
        assert_eq!(config.network_mode.as_deref(), Some("none"));
        assert_eq!(config.privileged, Some(false));
        assert_eq!(config.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(
            config.security_opt,
            Some(vec!["no-new-privileges:true".to_string()])
        );
    }

    #[test]
    fn test_host_config_with_network() {
        let spec = SandboxSpec::new("sbx-2", "node:20-slim").with_network(true);
        assert_eq!(host_config(&spec).network_mode.as_deref(), Some("bridge"));
    }

    #[test]
    fn test_wrap_command_records_process_group() {
        let cmd = vec!["python".to_string(), "main.py".to_string()];
        let wrapped = wrap_command(&cmd, "abc");

        assert_eq!(&wrapped[..4], &["setsid", "-w", "sh", "-c"]);
        assert!(wrapped[4].contains("echo $$ > /tmp/.devloop-exec-abc.pid"));
        assert!(wrapped[4].contains("exit $rc"));
        assert_eq!(&wrapped[5..], &["sh", "python", "main.py"]);
    }

    #[test]
    fn test_kill_command_targets_group() {
        let cmd = kill_command("abc");
        assert_eq!(cmd[0], "sh");
        assert!(cmd[2].contains("kill -KILL -- -$(cat /tmp/.devloop-exec-abc.pid)"));
    }
}
