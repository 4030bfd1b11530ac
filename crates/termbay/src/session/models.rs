//! Session data models and the lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::ports::PortPair;

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Aggregate built, nothing provisioned yet.
    Initializing,
    /// Container assigned, waiting for it to come up.
    Starting,
    /// Container is running.
    Running,
    /// Container has been stopped.
    Stopped,
    /// Session failed to start or crashed.
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "initializing" => Ok(SessionStatus::Initializing),
            "starting" => Ok(SessionStatus::Starting),
            "running" => Ok(SessionStatus::Running),
            "stopped" => Ok(SessionStatus::Stopped),
            "error" => Ok(SessionStatus::Error),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

impl TryFrom<String> for SessionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// Number of terminal endpoints a session exposes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalMode {
    /// Only the primary terminal.
    Single,
    /// Primary and manual terminals.
    #[default]
    Dual,
}

impl TerminalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalMode::Single => "single",
            TerminalMode::Dual => "dual",
        }
    }
}

impl std::fmt::Display for TerminalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TerminalMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "single" => Ok(TerminalMode::Single),
            "dual" => Ok(TerminalMode::Dual),
            _ => Err(format!("unknown terminal mode: {}", s)),
        }
    }
}

/// Configuration snapshot taken when the session was created.
///
/// Secrets are not part of the snapshot; only whether an SSH key was present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub repo_url: String,
    pub branch: String,
    #[serde(default)]
    pub git_user_name: Option<String>,
    #[serde(default)]
    pub git_user_email: Option<String>,
    #[serde(default)]
    pub has_ssh_key: bool,
    #[serde(default)]
    pub terminal_mode: TerminalMode,
}

/// Rejected state-machine transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot {action} session in status {from}")]
pub struct TransitionError {
    pub action: &'static str,
    pub from: SessionStatus,
}

/// Persisted form of a session, used by stores to rebuild the aggregate.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub name: String,
    pub config: SessionConfig,
    pub status: SessionStatus,
    pub container_id: Option<String>,
    pub ports: Option<PortPair>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: Option<DateTime<Utc>>,
}

/// A containerized development session.
///
/// All mutation goes through the transition methods below; each one bumps
/// `updated_at`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    id: String,
    name: String,
    config: SessionConfig,
    status: SessionStatus,
    container_id: Option<String>,
    ports: Option<PortPair>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_accessed_at: Option<DateTime<Utc>>,
}

impl Session {
    /// New session in `Initializing` with a fresh id.
    pub fn new(name: impl Into<String>, config: SessionConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            config,
            status: SessionStatus::Initializing,
            container_id: None,
            ports: None,
            created_at: now,
            updated_at: now,
            last_accessed_at: None,
        }
    }

    /// Rebuild from storage. A container without ports (or the reverse) is
    /// rejected.
    pub fn restore(record: SessionRecord) -> Result<Self, String> {
        if record.container_id.is_some() != record.ports.is_some() {
            return Err(format!(
                "session {} has inconsistent container/port assignment",
                record.id
            ));
        }
        Ok(Self {
            id: record.id,
            name: record.name,
            config: record.config,
            status: record.status,
            container_id: record.container_id,
            ports: record.ports,
            created_at: record.created_at,
            updated_at: record.updated_at,
            last_accessed_at: record.last_accessed_at,
        })
    }

    pub fn to_record(&self) -> SessionRecord {
        SessionRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            config: self.config.clone(),
            status: self.status,
            container_id: self.container_id.clone(),
            ports: self.ports,
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_accessed_at: self.last_accessed_at,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    pub fn ports(&self) -> Option<PortPair> {
        self.ports
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn last_accessed_at(&self) -> Option<DateTime<Utc>> {
        self.last_accessed_at
    }

    /// Attach the provisioned container and its ports; `Initializing` → `Starting`.
    pub fn assign_container(
        &mut self,
        container_id: impl Into<String>,
        ports: PortPair,
    ) -> Result<(), TransitionError> {
        if self.container_id.is_some() || self.status != SessionStatus::Initializing {
            return Err(self.illegal("assign container to"));
        }
        self.container_id = Some(container_id.into());
        self.ports = Some(ports);
        self.set_status(SessionStatus::Starting);
        Ok(())
    }

    pub fn mark_as_running(&mut self) -> Result<(), TransitionError> {
        if self.status != SessionStatus::Starting {
            return Err(self.illegal("mark as running"));
        }
        self.set_status(SessionStatus::Running);
        Ok(())
    }

    /// Callers confirm `Running` before calling this.
    pub fn stop(&mut self) {
        self.set_status(SessionStatus::Stopped);
    }

    pub fn mark_as_error(&mut self) {
        self.set_status(SessionStatus::Error);
    }

    /// Drop the container and port assignment after both were torn down.
    pub fn release_assignment(&mut self) {
        self.container_id = None;
        self.ports = None;
        self.touch_updated();
    }

    pub fn can_be_deleted(&self) -> bool {
        matches!(self.status, SessionStatus::Stopped | SessionStatus::Error)
    }

    /// Session is holding (or about to hold) a live container.
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            SessionStatus::Starting | SessionStatus::Running
        )
    }

    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.touch_updated();
    }

    /// Record an access.
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.last_accessed_at = Some(now);
        self.updated_at = now;
    }

    fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
        self.touch_updated();
    }

    fn touch_updated(&mut self) {
        self.updated_at = Utc::now();
    }

    fn illegal(&self, action: &'static str) -> TransitionError {
        TransitionError {
            action,
            from: self.status,
        }
    }
}

/// Filter for listing sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFilter {
    #[serde(default)]
    pub status: Option<SessionStatus>,
    #[serde(default)]
    pub name: Option<String>,
}

impl SessionFilter {
    pub fn with_status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            name: None,
        }
    }

    pub fn matches(&self, session: &Session) -> bool {
        if let Some(status) = self.status
            && session.status() != status
        {
            return false;
        }
        if let Some(name) = &self.name
            && session.name() != name
        {
            return false;
        }
        true
    }
}
