//! Container runtime management module.
//!
//! Provides an async interface to manage session containers via the Docker or
//! Podman CLI. The runtime is auto-detected or can be configured explicitly.

mod container;
mod error;

pub use container::{
    ContainerConfig, ContainerInfo, ContainerPort, ContainerState, ExecOutput, ExecStream,
    PortMapping, parse_inspect_output,
};
pub use error::{ContainerError, ContainerResult};

use container::validate_container_id_or_name;
use error::{stderr_means_not_found, stderr_means_unavailable};

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::process::{Output, Stdio};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Buffered lines per streaming exec before the reader applies backpressure.
const STREAM_BUFFER: usize = 256;

/// Wraps a streamed command so its first stdout line is the in-container PID.
/// Killing the local `exec` client does not reach the process inside.
const STREAM_LAUNCHER: &str = r#"echo $$; exec "$@""#;

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Docker runtime.
    #[default]
    Docker,
    /// Podman runtime.
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.default_binary())
    }
}

/// Capability boundary over the container engine.
///
/// The session orchestrator and the repository watcher only talk to the
/// engine through this trait, so tests can substitute an in-process fake.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// Create and start a container, returning the engine-assigned id.
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String>;

    async fn inspect_container(&self, container_id: &str) -> ContainerResult<ContainerInfo>;

    /// Start a container. Starting a running container succeeds.
    async fn start_container(&self, container_id: &str) -> ContainerResult<()>;

    /// Stop a container. Stopping a stopped container succeeds.
    async fn stop_container(
        &self,
        container_id: &str,
        grace_seconds: Option<u32>,
    ) -> ContainerResult<()>;

    /// Remove a container. Removing a container that no longer exists succeeds.
    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()>;

    /// Execute a command and wait for it to finish.
    async fn exec(
        &self,
        container_id: &str,
        argv: &[&str],
        workdir: Option<&str>,
    ) -> ContainerResult<ExecOutput>;

    /// Execute a long-running command whose stdout is streamed line by line.
    /// Killing or dropping the stream also terminates the command inside the
    /// container.
    async fn exec_stream(&self, container_id: &str, argv: &[&str])
    -> ContainerResult<ExecStream>;

    /// Check that the engine itself answers.
    async fn ping(&self) -> ContainerResult<()>;
}

/// Container runtime client for managing containers through the CLI.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    runtime_type: RuntimeType,
    binary: String,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime {
    /// Create a new container runtime with auto-detection.
    ///
    /// Prefers Docker, falls back to Podman.
    pub fn new() -> Self {
        let runtime_type = if !Self::is_binary_available("docker")
            && Self::is_binary_available("podman")
        {
            RuntimeType::Podman
        } else {
            RuntimeType::Docker
        };
        Self::with_type(runtime_type)
    }

    /// Create a container runtime with a specific type.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
        }
    }

    /// Create a container runtime with a custom binary path.
    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
        }
    }

    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run the runtime binary to completion.
    ///
    /// Failing to spawn the binary at all means the engine is unavailable.
    async fn output<S: AsRef<std::ffi::OsStr>>(
        &self,
        command: &str,
        args: &[S],
    ) -> ContainerResult<Output> {
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ContainerError::RuntimeUnavailable(format!("{} not found: {}", self.binary, e))
                } else {
                    ContainerError::CommandFailed {
                        command: command.to_string(),
                        message: e.to_string(),
                    }
                }
            })
    }

    /// Map a failed invocation onto the error taxonomy.
    fn failure(command: &str, container_id: &str, output: &Output) -> ContainerError {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr_means_unavailable(&stderr) {
            ContainerError::RuntimeUnavailable(stderr)
        } else if stderr_means_not_found(&stderr) {
            ContainerError::ContainerNotFound(container_id.to_string())
        } else {
            ContainerError::CommandFailed {
                command: command.to_string(),
                message: stderr,
            }
        }
    }

    /// Terminate a process started by [`ContainerRuntimeApi::exec_stream`].
    async fn kill_remote(&self, container_id: &str, pid: u32) {
        let pid = pid.to_string();
        match self
            .output("exec", &["exec", container_id, "kill", pid.as_str()])
            .await
        {
            Ok(out) if out.status.success() => {
                debug!("Killed process {} in container {}", pid, container_id);
            }
            Ok(out) => debug!(
                "Killing process {} in container {} failed: {}",
                pid,
                container_id,
                String::from_utf8_lossy(&out.stderr).trim()
            ),
            Err(e) => warn!(
                "Could not kill process {} in container {}: {}",
                pid, container_id, e
            ),
        }
    }

    fn run_args(config: &ContainerConfig) -> Vec<String> {
        let mut args: Vec<String> = vec!["run".to_string(), "-d".to_string()];

        if let Some(ref name) = config.name {
            args.push("--name".to_string());
            args.push(name.clone());
        }

        for port in &config.ports {
            args.push("--expose".to_string());
            args.push(port.container_port.to_string());
            args.push("-p".to_string());
            args.push(format!("{}:{}", port.host_port, port.container_port));
        }

        for (key, value) in &config.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        for (key, value) in &config.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        if let Some(ref workdir) = config.workdir {
            args.push("-w".to_string());
            args.push(workdir.clone());
        }

        args.push(config.image.clone());
        args.extend(config.command.iter().cloned());
        args
    }
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;

        let args = Self::run_args(config);
        let output = self.output("run", &args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr_means_unavailable(&stderr) {
                return Err(ContainerError::RuntimeUnavailable(stderr));
            }
            return Err(ContainerError::CreateFailed(stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn inspect_container(&self, container_id: &str) -> ContainerResult<ContainerInfo> {
        validate_container_id_or_name(container_id)?;

        let output = self
            .output("inspect", &["inspect", "--type", "container", container_id])
            .await?;

        if !output.status.success() {
            return Err(Self::failure("inspect", container_id, &output));
        }

        parse_inspect_output(&String::from_utf8_lossy(&output.stdout))
    }

    async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let output = self.output("start", &["start", container_id]).await?;
        if !output.status.success() {
            return Err(Self::failure("start", container_id, &output));
        }
        Ok(())
    }

    async fn stop_container(
        &self,
        container_id: &str,
        grace_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let mut args: Vec<String> = vec!["stop".to_string()];
        if let Some(t) = grace_seconds {
            args.push("-t".to_string());
            args.push(t.to_string());
        }
        args.push(container_id.to_string());

        let output = self.output("stop", &args).await?;
        if !output.status.success() {
            return Err(Self::failure("stop", container_id, &output));
        }
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let mut args = vec!["rm"];
        if force {
            args.push("-f");
        }
        args.push(container_id);

        let output = self.output("rm", &args).await?;
        if !output.status.success() {
            return match Self::failure("rm", container_id, &output) {
                ContainerError::ContainerNotFound(_) => {
                    debug!("Container {} already removed", container_id);
                    Ok(())
                }
                other => Err(other),
            };
        }
        Ok(())
    }

    async fn exec(
        &self,
        container_id: &str,
        argv: &[&str],
        workdir: Option<&str>,
    ) -> ContainerResult<ExecOutput> {
        validate_container_id_or_name(container_id)?;
        if argv.is_empty() {
            return Err(ContainerError::InvalidInput(
                "exec requires a command".to_string(),
            ));
        }

        let mut args = vec!["exec"];
        if let Some(dir) = workdir {
            args.push("-w");
            args.push(dir);
        }
        args.push(container_id);
        args.extend(argv);

        let output = self.output("exec", &args).await?;
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        // A non-zero exit of the command itself is a result, not an error; only
        // runtime-level failures are surfaced.
        if !output.status.success() {
            if stderr_means_unavailable(&stderr) {
                return Err(ContainerError::RuntimeUnavailable(stderr.trim().to_string()));
            }
            if stderr_means_not_found(&stderr) {
                return Err(ContainerError::ContainerNotFound(container_id.to_string()));
            }
        }

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn exec_stream(
        &self,
        container_id: &str,
        argv: &[&str],
    ) -> ContainerResult<ExecStream> {
        validate_container_id_or_name(container_id)?;
        if argv.is_empty() {
            return Err(ContainerError::InvalidInput(
                "exec requires a command".to_string(),
            ));
        }

        let mut child = Command::new(&self.binary)
            .arg("exec")
            .arg(container_id)
            .args(["sh", "-c", STREAM_LAUNCHER, "sh"])
            .args(argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ContainerError::RuntimeUnavailable(format!("{} not found: {}", self.binary, e))
                } else {
                    ContainerError::CommandFailed {
                        command: "exec".to_string(),
                        message: e.to_string(),
                    }
                }
            })?;

        let stdout = child.stdout.take().ok_or_else(|| ContainerError::CommandFailed {
            command: "exec".to_string(),
            message: "stdout not captured".to_string(),
        })?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let id = container_id.to_string();
        let runtime = self.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut remote_pid: Option<u32> = None;
            let mut finished = false;
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) if remote_pid.is_none() => match line.trim().parse() {
                            Ok(pid) => remote_pid = Some(pid),
                            Err(_) => {
                                warn!("Exec stream for container {} sent no PID: {:?}", id, line);
                                break;
                            }
                        },
                        Ok(Some(line)) => {
                            if tx.send(line).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            finished = true;
                            break;
                        }
                        Err(e) => {
                            warn!("Reading exec stream for container {} failed: {:?}", id, e);
                            break;
                        }
                    }
                }
            }
            if !finished && let Some(pid) = remote_pid {
                runtime.kill_remote(&id, pid).await;
            }
            if let Err(e) = child.kill().await {
                debug!("Exec stream process for container {} already gone: {:?}", id, e);
            }
            debug!("Exec stream for container {} closed", id);
        });

        Ok(ExecStream::new(rx, cancel))
    }

    async fn ping(&self) -> ContainerResult<()> {
        let output = self
            .output("version", &["version", "--format", "json"])
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ContainerError::RuntimeUnavailable(stderr));
        }
        Ok(())
    }
}
