//! Container and terminal readiness probing.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::container::{ContainerError, ContainerRuntimeApi, ContainerState};
use crate::ports::PortPair;

use super::models::TerminalMode;

#[derive(Debug, Error)]
pub enum ReadinessError {
    #[error("container {container_id} not running after {attempts} attempts (last state: {last_state})")]
    NotRunning {
        container_id: String,
        attempts: u32,
        last_state: ContainerState,
    },

    #[error("inspect failed while waiting for container: {0}")]
    Inspect(#[from] ContainerError),
}

/// Polling bounds for container and terminal readiness.
#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    pub poll_interval: Duration,
    pub max_attempts: u32,
    /// Per-request timeout of the terminal HTTP probe.
    pub probe_timeout: Duration,
    pub probe_host: String,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_attempts: 30,
            probe_timeout: Duration::from_secs(2),
            probe_host: "127.0.0.1".to_string(),
        }
    }
}

/// Poll `inspect` until the container reports `running`.
///
/// Any inspect error aborts the wait; running out of attempts is an error too.
pub async fn wait_for_running(
    runtime: &dyn ContainerRuntimeApi,
    container_id: &str,
    config: &ReadinessConfig,
) -> Result<(), ReadinessError> {
    let mut last_state = ContainerState::Unknown;

    for attempt in 1..=config.max_attempts {
        let info = runtime.inspect_container(container_id).await?;
        if info.state == ContainerState::Running {
            debug!(
                "Container {} running after {} attempt(s)",
                container_id, attempt
            );
            return Ok(());
        }

        trace!(
            "Container {} in state {} (attempt {}/{})",
            container_id, info.state, attempt, config.max_attempts
        );
        last_state = info.state;

        if attempt < config.max_attempts {
            tokio::time::sleep(config.poll_interval).await;
        }
    }

    Err(ReadinessError::NotRunning {
        container_id: container_id.to_string(),
        attempts: config.max_attempts,
        last_state,
    })
}

/// Checks whether a terminal endpoint accepts connections.
#[async_trait]
pub trait TerminalProbe: Send + Sync {
    /// Never fails; unreachable means `false`.
    async fn is_ready(&self, port: u16) -> bool;
}

/// HTTP probe: any response, including 4xx/5xx, counts as ready.
#[derive(Debug, Clone)]
pub struct HttpTerminalProbe {
    client: reqwest::Client,
    host: String,
}

impl HttpTerminalProbe {
    pub fn new(config: &ReadinessConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.probe_timeout)
            .build()
            .context("building terminal probe HTTP client")?;
        Ok(Self {
            client,
            host: config.probe_host.clone(),
        })
    }
}

#[async_trait]
impl TerminalProbe for HttpTerminalProbe {
    async fn is_ready(&self, port: u16) -> bool {
        let url = format!("http://{}:{}/", self.host, port);
        match self.client.get(&url).send().await {
            Ok(res) => {
                trace!("Terminal probe {} -> {}", url, res.status());
                true
            }
            Err(e) => {
                trace!("Terminal probe {} failed: {}", url, e);
                false
            }
        }
    }
}

/// Aggregate terminal health of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalHealth {
    pub claude_ready: bool,
    pub manual_ready: bool,
    pub all_ready: bool,
}

/// Probe the session's terminals. In single mode the manual port is not
/// probed and counts as ready.
pub async fn check_terminal_health(
    probe: &dyn TerminalProbe,
    ports: PortPair,
    mode: TerminalMode,
) -> TerminalHealth {
    let (claude_ready, manual_ready) = match mode {
        TerminalMode::Single => (probe.is_ready(ports.claude_port()).await, true),
        TerminalMode::Dual => tokio::join!(
            probe.is_ready(ports.claude_port()),
            probe.is_ready(ports.manual_port())
        ),
    };

    TerminalHealth {
        claude_ready,
        manual_ready,
        all_ready: claude_ready && manual_ready,
    }
}
