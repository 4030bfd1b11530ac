//! Container types and configuration.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::{ContainerError, ContainerResult};

/// A port published on the host under the same number it listens on inside
/// the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
}

impl PortMapping {
    /// Publish `port` on the host as the identical port.
    pub fn same(port: u16) -> Self {
        Self {
            host_port: port,
            container_port: port,
        }
    }
}

/// Configuration for creating a new container.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    /// Container name (optional).
    pub name: Option<String>,
    /// Docker/OCI image to use.
    pub image: String,
    /// Command to run (image default when empty).
    pub command: Vec<String>,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Published and exposed ports.
    pub ports: Vec<PortMapping>,
    /// Working directory inside the container.
    pub workdir: Option<String>,
    /// Labels for the container.
    pub labels: BTreeMap<String, String>,
}

impl ContainerConfig {
    /// Create a new container config with the given image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Validate all container configuration fields.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;

        if let Some(ref name) = self.name {
            validate_container_name(name)?;
        }

        for key in self.env.keys() {
            validate_env_var_key(key)?;
        }

        if let Some(ref workdir) = self.workdir
            && !workdir.starts_with('/')
        {
            return Err(ContainerError::InvalidInput(format!(
                "working directory '{}' must be absolute",
                workdir
            )));
        }

        Ok(())
    }

    /// Set the container name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the command to run.
    pub fn command(mut self, cmd: Vec<String>) -> Self {
        self.command = cmd;
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add an environment variable when a value is present.
    pub fn env_opt(self, key: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(value) => self.env(key, value),
            None => self,
        }
    }

    /// Expose `port` and publish it to the same host port.
    pub fn port(mut self, port: u16) -> Self {
        self.ports.push(PortMapping::same(port));
        self
    }

    /// Set the working directory.
    pub fn workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    /// Add a label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Container state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    #[default]
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerState::Created => write!(f, "created"),
            ContainerState::Running => write!(f, "running"),
            ContainerState::Paused => write!(f, "paused"),
            ContainerState::Restarting => write!(f, "restarting"),
            ContainerState::Removing => write!(f, "removing"),
            ContainerState::Exited => write!(f, "exited"),
            ContainerState::Dead => write!(f, "dead"),
            ContainerState::Unknown => write!(f, "unknown"),
        }
    }
}

impl ContainerState {
    /// Parse the `State.Status` string reported by docker/podman.
    pub fn parse(status: &str) -> Self {
        match status.trim().to_lowercase().as_str() {
            "created" | "configured" | "initialized" => ContainerState::Created,
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "removing" => ContainerState::Removing,
            "exited" | "stopped" => ContainerState::Exited,
            "dead" => ContainerState::Dead,
            _ => ContainerState::Unknown,
        }
    }
}

/// Published port binding reported by `inspect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerPort {
    pub container_port: u16,
    pub host_port: Option<u16>,
    pub protocol: String,
}

/// Result of inspecting a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub state: ContainerState,
    pub ports: Vec<ContainerPort>,
    pub labels: HashMap<String, String>,
    pub created_at: String,
}

// Raw `inspect` JSON shape shared by docker and podman.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawInspect {
    id: String,
    #[serde(default)]
    created: String,
    #[serde(default)]
    state: RawState,
    #[serde(default)]
    config: RawConfig,
    #[serde(default)]
    network_settings: RawNetworkSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawState {
    #[serde(default)]
    status: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawConfig {
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawNetworkSettings {
    #[serde(default)]
    ports: Option<HashMap<String, Option<Vec<RawBinding>>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawBinding {
    #[serde(default)]
    host_port: String,
}

/// Parse the JSON array printed by `docker inspect` / `podman inspect`.
pub fn parse_inspect_output(output: &str) -> ContainerResult<ContainerInfo> {
    let raw: Vec<RawInspect> =
        serde_json::from_str(output).map_err(|e| ContainerError::ParseError(e.to_string()))?;
    let raw = raw
        .into_iter()
        .next()
        .ok_or_else(|| ContainerError::ParseError("inspect returned no objects".to_string()))?;

    let mut ports = Vec::new();
    for (key, bindings) in raw.network_settings.ports.unwrap_or_default() {
        let (port, protocol) = key.split_once('/').unwrap_or((key.as_str(), "tcp"));
        let Ok(container_port) = port.parse::<u16>() else {
            continue;
        };
        let host_port = bindings
            .unwrap_or_default()
            .iter()
            .find_map(|b| b.host_port.parse::<u16>().ok());
        ports.push(ContainerPort {
            container_port,
            host_port,
            protocol: protocol.to_string(),
        });
    }
    ports.sort_by_key(|p| p.container_port);

    Ok(ContainerInfo {
        id: raw.id,
        state: ContainerState::parse(&raw.state.status),
        ports,
        labels: raw.config.labels.unwrap_or_default(),
        created_at: raw.created,
    })
}

/// Output of a command executed inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A long-running command inside a container whose stdout arrives line by line.
///
/// Killing (or dropping) the stream terminates the remote process and closes
/// the channel.
#[derive(Debug)]
pub struct ExecStream {
    lines: mpsc::Receiver<String>,
    cancel: CancellationToken,
}

impl ExecStream {
    pub fn new(lines: mpsc::Receiver<String>, cancel: CancellationToken) -> Self {
        Self { lines, cancel }
    }

    /// Next emitted line, or `None` once the process exited or was killed.
    pub async fn next_line(&mut self) -> Option<String> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            line = self.lines.recv() => line,
            _ = self.cancel.cancelled() => None,
        }
    }

    /// Terminate the stream and the remote process.
    pub fn kill(&self) {
        self.cancel.cancel();
    }

    /// Token that kills the stream when cancelled.
    pub fn kill_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for ExecStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ============================================================================
// Input Validation Functions
// ============================================================================

/// Validate a Docker/OCI image name (`[registry/][namespace/]name[:tag][@digest]`).
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() {
        return Err(ContainerError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }

    if image.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || ".-_/:@".contains(c);
    if !image.chars().all(valid_chars) || image.contains("..") {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{}' contains invalid characters",
            image
        )));
    }

    Ok(())
}

/// Validate a container ID or name as accepted by `stop`, `rm`, `exec`.
pub fn validate_container_id_or_name(id: &str) -> ContainerResult<()> {
    if id.is_empty() {
        return Err(ContainerError::InvalidInput(
            "container ID or name cannot be empty".to_string(),
        ));
    }

    if id.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container ID or name exceeds maximum length".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.';
    if !id.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container ID or name '{}' contains invalid characters",
            id
        )));
    }

    Ok(())
}

/// Container names must start with an alphanumeric character or underscore.
fn validate_container_name(name: &str) -> ContainerResult<()> {
    validate_container_id_or_name(name)?;

    let starts_ok = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
    if !starts_ok {
        return Err(ContainerError::InvalidInput(
            "container name must start with an alphanumeric character or underscore".to_string(),
        ));
    }

    Ok(())
}

/// Environment variable names follow POSIX conventions.
fn validate_env_var_key(key: &str) -> ContainerResult<()> {
    let starts_ok = key
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !starts_ok || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' is not a valid identifier",
            key
        )));
    }

    Ok(())
}
