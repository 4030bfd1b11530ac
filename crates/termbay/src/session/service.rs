//! Session orchestration.
//!
//! [`SessionService`] drives sessions through their lifecycle: it allocates
//! ports, provisions containers, waits for readiness, persists every
//! transition and unwinds partial work when a step fails.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::container::{ContainerConfig, ContainerInfo, ContainerRuntimeApi};
use crate::events::SessionEvents;
use crate::git::{self, CommitOutcome, GitStatus};
use crate::ports::{PortAllocator, PortPair, PortRange};
use crate::settings::{GlobalSettings, SettingsProvider};
use crate::watcher::{RepoWatcher, WatcherConfig};

use super::error::{SessionError, SessionResult};
use super::models::{Session, SessionConfig, SessionFilter, SessionStatus, TerminalMode};
use super::readiness::{self, ReadinessConfig, TerminalHealth, TerminalProbe};
use super::store::SessionStore;

/// Default container image.
const DEFAULT_IMAGE: &str = "termbay-session:latest";

/// Default branch when neither the request nor the repository specifies one.
const DEFAULT_BRANCH: &str = "main";

/// Label carrying the owning session id.
pub const SESSION_ID_LABEL: &str = "termbay.session-id";

/// Label marking containers managed by this service.
pub const MANAGED_LABEL: &str = "termbay.managed";

/// Session service configuration.
#[derive(Debug, Clone)]
pub struct SessionServiceConfig {
    /// Container image for session containers.
    pub image: String,
    /// Host ports handed out to session terminals.
    pub port_range: PortRange,
    /// Ceiling on sessions that are not in `Error`.
    pub max_sessions: usize,
    /// Seconds the runtime waits before killing a stopping container.
    pub stop_grace_seconds: u32,
    pub readiness: ReadinessConfig,
    pub watcher: WatcherConfig,
    /// Age after which a persisted `Initializing`/`Starting` record is taken
    /// to be left over from a creation that died, and is failed at startup.
    pub stale_start_after: Duration,
}

impl Default for SessionServiceConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            port_range: PortRange::default(),
            max_sessions: SessionService::DEFAULT_MAX_SESSIONS,
            stop_grace_seconds: 10,
            readiness: ReadinessConfig::default(),
            watcher: WatcherConfig::default(),
            stale_start_after: Duration::from_secs(300),
        }
    }
}

/// Request to create a new session.
///
/// Explicit fields win over the global settings.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub name: String,
    pub repo_url: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub git_user_name: Option<String>,
    #[serde(default)]
    pub git_user_email: Option<String>,
    #[serde(default)]
    pub ssh_private_key: Option<String>,
    #[serde(default)]
    pub claude_token: Option<String>,
    #[serde(default)]
    pub terminal_mode: Option<TerminalMode>,
}

impl std::fmt::Debug for CreateSessionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreateSessionRequest")
            .field("name", &self.name)
            .field("repo_url", &self.repo_url)
            .field("branch", &self.branch)
            .field("git_user_name", &self.git_user_name)
            .field("git_user_email", &self.git_user_email)
            .field("ssh_private_key", &self.ssh_private_key.as_ref().map(|_| "<redacted>"))
            .field("claude_token", &self.claude_token.as_ref().map(|_| "<redacted>"))
            .field("terminal_mode", &self.terminal_mode)
            .finish()
    }
}

impl CreateSessionRequest {
    pub fn new(name: impl Into<String>, repo_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            repo_url: repo_url.into(),
            ..Default::default()
        }
    }

    /// Request that recreates a session from its stored snapshot. Secrets come
    /// from the settings again since the snapshot never holds them.
    pub fn from_snapshot(name: &str, config: &SessionConfig) -> Self {
        Self {
            name: name.to_string(),
            repo_url: config.repo_url.clone(),
            branch: Some(config.branch.clone()),
            git_user_name: config.git_user_name.clone(),
            git_user_email: config.git_user_email.clone(),
            ssh_private_key: None,
            claude_token: None,
            terminal_mode: Some(config.terminal_mode),
        }
    }

    fn validate(&self) -> SessionResult<()> {
        if self.name.trim().is_empty() {
            return Err(SessionError::Validation(
                "session name is required".to_string(),
            ));
        }
        if self.repo_url.trim().is_empty() {
            return Err(SessionError::Validation(
                "repository URL is required".to_string(),
            ));
        }
        if let Some(branch) = &self.branch
            && branch.trim().is_empty()
        {
            return Err(SessionError::Validation(
                "branch cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Session plus a best-effort view of its container.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session: Session,
    pub container: Option<ContainerInfo>,
}

/// Removes an admitted-but-unfinished creation from the in-flight set.
struct Admission {
    inflight: Arc<DashSet<String>>,
    session_id: String,
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.inflight.remove(&self.session_id);
    }
}

/// Service for managing container sessions.
#[derive(Clone)]
pub struct SessionService {
    store: Arc<dyn SessionStore>,
    runtime: Arc<dyn ContainerRuntimeApi>,
    probe: Arc<dyn TerminalProbe>,
    settings: Arc<dyn SettingsProvider>,
    events: Arc<dyn SessionEvents>,
    allocator: Arc<PortAllocator>,
    watcher: RepoWatcher,
    /// Per-session operation locks.
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    /// Serializes the ceiling check against concurrent creations.
    admission: Arc<Mutex<()>>,
    /// Sessions admitted but not yet persisted.
    inflight: Arc<DashSet<String>>,
    config: SessionServiceConfig,
}

impl SessionService {
    /// Default ceiling on concurrently held sessions.
    pub const DEFAULT_MAX_SESSIONS: usize = 10;

    pub fn new(
        config: SessionServiceConfig,
        runtime: Arc<dyn ContainerRuntimeApi>,
        store: Arc<dyn SessionStore>,
        settings: Arc<dyn SettingsProvider>,
        events: Arc<dyn SessionEvents>,
        probe: Arc<dyn TerminalProbe>,
    ) -> Self {
        let watcher = RepoWatcher::new(runtime.clone(), events.clone(), config.watcher.clone());
        Self {
            store,
            runtime,
            probe,
            settings,
            events,
            allocator: Arc::new(PortAllocator::new(config.port_range)),
            watcher,
            locks: Arc::new(DashMap::new()),
            admission: Arc::new(Mutex::new(())),
            inflight: Arc::new(DashSet::new()),
            config,
        }
    }

    pub fn config(&self) -> &SessionServiceConfig {
        &self.config
    }

    pub fn allocator(&self) -> &PortAllocator {
        &self.allocator
    }

    pub fn watcher(&self) -> &RepoWatcher {
        &self.watcher
    }

    // ========================================================================
    // Create
    // ========================================================================

    /// Create a session and wait until its container runs.
    ///
    /// Every failure after port allocation releases what was acquired and
    /// leaves an `Error` record behind.
    pub async fn create_session(&self, request: CreateSessionRequest) -> SessionResult<Session> {
        request.validate()?;
        let settings = self.settings.get().await.map_err(SessionError::Settings)?;

        let config = Self::resolve_config(&request, &settings);
        let mut session = Session::new(request.name.trim(), config);
        let _admission = self.admit(session.id()).await?;

        let ports = self.allocator.allocate_pair().await?;
        info!(
            "Creating session {} ({}) on ports {}",
            session.id(),
            session.name(),
            ports
        );

        let container_config = self.container_config(&session, ports, &request, &settings);
        let container_id = match self.runtime.create_container(&container_config).await {
            Ok(id) => id,
            Err(e) => {
                warn!("Container creation failed for session {}: {}", session.id(), e);
                self.allocator.release_pair(&ports).await;
                session.mark_as_error();
                self.save_compensated(&session).await;
                return Err(SessionError::SessionCreateFailed {
                    session_id: session.id().to_string(),
                    source: e,
                });
            }
        };

        if let Err(e) = session.assign_container(&container_id, ports) {
            self.discard_container(&mut session, &container_id, ports).await;
            return Err(e.into());
        }
        if let Err(e) = self.store.save(&session).await {
            self.discard_container(&mut session, &container_id, ports).await;
            return Err(SessionError::Store(e));
        }
        self.notify(&session);

        if let Err(e) =
            readiness::wait_for_running(self.runtime.as_ref(), &container_id, &self.config.readiness)
                .await
        {
            warn!("Session {} never became ready: {}", session.id(), e);
            self.discard_container(&mut session, &container_id, ports).await;
            return Err(SessionError::ContainerStartTimeout {
                session_id: session.id().to_string(),
                source: e,
            });
        }

        session.mark_as_running()?;
        if let Err(e) = self.store.save(&session).await {
            warn!("Failed to record session {} as running: {:#}", session.id(), e);
            self.discard_container(&mut session, &container_id, ports).await;
            return Err(SessionError::Store(e));
        }
        self.notify(&session);

        let health = readiness::check_terminal_health(
            self.probe.as_ref(),
            ports,
            session.config().terminal_mode,
        )
        .await;
        if health.all_ready {
            debug!("Terminals of session {} accept connections", session.id());
        } else {
            info!(
                "Terminals of session {} not reachable yet (claude={}, manual={})",
                session.id(),
                health.claude_ready,
                health.manual_ready
            );
        }

        self.watcher.start_watching(session.id(), &container_id);
        info!("Session {} running in container {}", session.id(), container_id);
        Ok(session)
    }

    fn resolve_config(request: &CreateSessionRequest, settings: &GlobalSettings) -> SessionConfig {
        SessionConfig {
            repo_url: request.repo_url.trim().to_string(),
            branch: request
                .branch
                .as_deref()
                .map(str::trim)
                .unwrap_or(DEFAULT_BRANCH)
                .to_string(),
            git_user_name: request
                .git_user_name
                .clone()
                .or_else(|| settings.git_user_name.clone()),
            git_user_email: request
                .git_user_email
                .clone()
                .or_else(|| settings.git_user_email.clone()),
            has_ssh_key: request.ssh_private_key.is_some() || settings.ssh_private_key.is_some(),
            terminal_mode: request.terminal_mode.unwrap_or_default(),
        }
    }

    fn container_config(
        &self,
        session: &Session,
        ports: PortPair,
        request: &CreateSessionRequest,
        settings: &GlobalSettings,
    ) -> ContainerConfig {
        let config = session.config();
        let short_id: String = session.id().chars().take(8).collect();

        ContainerConfig::new(&self.config.image)
            .name(format!("termbay-{}", short_id))
            .port(ports.claude_port())
            .port(ports.manual_port())
            .env("REPO_URL", &config.repo_url)
            .env("REPO_BRANCH", &config.branch)
            .env("TERMINAL_MODE", config.terminal_mode.as_str())
            .env("CLAUDE_PORT", ports.claude_port().to_string())
            .env("MANUAL_PORT", ports.manual_port().to_string())
            .env("WORKSPACE_DIR", &self.config.watcher.repo_path)
            .env_opt("GIT_USER_NAME", config.git_user_name.as_deref())
            .env_opt("GIT_USER_EMAIL", config.git_user_email.as_deref())
            .env_opt(
                "SSH_PRIVATE_KEY",
                request
                    .ssh_private_key
                    .as_deref()
                    .or(settings.ssh_private_key.as_deref()),
            )
            .env_opt(
                "CLAUDE_CODE_OAUTH_TOKEN",
                request
                    .claude_token
                    .as_deref()
                    .or(settings.claude_token.as_deref()),
            )
            .label(SESSION_ID_LABEL, session.id())
            .label(MANAGED_LABEL, "true")
    }

    /// Enforce the session ceiling and register the creation as in flight.
    async fn admit(&self, session_id: &str) -> SessionResult<Admission> {
        let _gate = self.admission.lock().await;

        let held = self
            .store
            .find_all(&SessionFilter::default())
            .await?
            .iter()
            .filter(|s| s.status() != SessionStatus::Error)
            .filter(|s| !self.inflight.contains(s.id()))
            .count()
            + self.inflight.len();

        if held >= self.config.max_sessions {
            return Err(SessionError::LimitExceeded {
                active: held,
                max: self.config.max_sessions,
            });
        }

        self.inflight.insert(session_id.to_string());
        Ok(Admission {
            inflight: self.inflight.clone(),
            session_id: session_id.to_string(),
        })
    }

    /// Tear down a container that will never serve its session and record
    /// the session as failed. Removal is best effort; a container left behind
    /// is logged with its session label so it can be found and removed.
    async fn discard_container(&self, session: &mut Session, container_id: &str, ports: PortPair) {
        if let Err(e) = self.runtime.remove_container(container_id, true).await {
            error!(
                "Orphaned container {} (label {}={}) could not be removed: {}",
                container_id,
                SESSION_ID_LABEL,
                session.id(),
                e
            );
        }
        self.allocator.release_pair(&ports).await;
        session.release_assignment();
        session.mark_as_error();
        self.save_compensated(session).await;
    }

    /// Persist during compensation; failures are logged, never returned.
    async fn save_compensated(&self, session: &Session) {
        match self.store.save(session).await {
            Ok(()) => self.notify(session),
            Err(e) => warn!("Failed to persist failed session {}: {:#}", session.id(), e),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Stop a running session. Its container and ports stay assigned.
    pub async fn stop_session(&self, session_id: &str) -> SessionResult<Session> {
        let _guard = self.lock_session(session_id).await?;
        let mut session = self.load(session_id).await?;
        self.stop_locked(&mut session).await?;
        Ok(session)
    }

    async fn stop_locked(&self, session: &mut Session) -> SessionResult<()> {
        if session.status() != SessionStatus::Running {
            return Err(SessionError::illegal("stop", session.status()));
        }

        if let Some(container_id) = session.container_id() {
            self.runtime
                .stop_container(container_id, Some(self.config.stop_grace_seconds))
                .await?;
        }

        session.stop();
        self.store.save(session).await?;
        self.watcher.stop_watching(session.id());
        self.notify(session);
        info!("Session {} stopped", session.id());
        Ok(())
    }

    /// Starting a stopped session in place is not supported; use restart.
    pub async fn start_session(&self, session_id: &str) -> SessionResult<Session> {
        let _guard = self.lock_session(session_id).await?;
        let session = self.load(session_id).await?;
        match session.status() {
            SessionStatus::Stopped | SessionStatus::Error => Err(SessionError::NotImplemented(
                "starting a stopped session in place (use restart)",
            )),
            status => Err(SessionError::illegal("start", status)),
        }
    }

    /// Stop if running, tear the session down and create a fresh one from the
    /// same name and configuration. Returns the new session.
    pub async fn restart_session(&self, session_id: &str) -> SessionResult<Session> {
        let request = {
            let _guard = self.lock_session(session_id).await?;
            let mut session = self.load(session_id).await?;
            match session.status() {
                SessionStatus::Initializing | SessionStatus::Starting => {
                    return Err(SessionError::illegal("restart", session.status()));
                }
                SessionStatus::Running => self.stop_locked(&mut session).await?,
                SessionStatus::Stopped | SessionStatus::Error => {}
            }
            self.delete_locked(&session).await?;
            CreateSessionRequest::from_snapshot(session.name(), session.config())
        };

        info!("Recreating session {} as a new session", session_id);
        self.create_session(request).await
    }

    /// Delete a stopped or failed session and release its resources.
    ///
    /// Each step is idempotent, so a delete that failed midway can be retried.
    pub async fn delete_session(&self, session_id: &str) -> SessionResult<()> {
        let _guard = self.lock_session(session_id).await?;
        let session = self.load(session_id).await?;
        if !session.can_be_deleted() {
            return Err(SessionError::illegal("delete", session.status()));
        }
        self.delete_locked(&session).await
    }

    async fn delete_locked(&self, session: &Session) -> SessionResult<()> {
        self.watcher.stop_watching(session.id());

        if let Some(container_id) = session.container_id() {
            self.runtime.remove_container(container_id, true).await?;
        }
        if let Some(ports) = session.ports() {
            self.allocator.release_pair(&ports).await;
        }
        self.store.delete(session.id()).await?;
        self.locks.remove(session.id());

        info!("Session {} deleted", session.id());
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Session record plus container state; records the access.
    pub async fn get_session_info(&self, session_id: &str) -> SessionResult<SessionInfo> {
        let _guard = self.lock_session(session_id).await?;
        let mut session = self.load(session_id).await?;
        session.touch();
        self.store.save(&session).await?;

        let container = match session.container_id() {
            Some(container_id) => match self.runtime.inspect_container(container_id).await {
                Ok(info) => Some(info),
                Err(e) => {
                    debug!("Inspect of {} failed: {}", container_id, e);
                    None
                }
            },
            None => None,
        };

        Ok(SessionInfo { session, container })
    }

    pub async fn list_sessions(&self, filter: &SessionFilter) -> SessionResult<Vec<Session>> {
        Ok(self.store.find_all(filter).await?)
    }

    pub async fn check_terminal_health(&self, session_id: &str) -> SessionResult<TerminalHealth> {
        let session = self.load(&Self::parse_id(session_id)?).await?;
        let Some(ports) = session.ports() else {
            return Err(SessionError::illegal(
                "check terminals of",
                session.status(),
            ));
        };
        Ok(readiness::check_terminal_health(
            self.probe.as_ref(),
            ports,
            session.config().terminal_mode,
        )
        .await)
    }

    pub async fn get_git_status(&self, session_id: &str) -> SessionResult<GitStatus> {
        let session = self.load(&Self::parse_id(session_id)?).await?;
        let container_id = Self::running_container(&session, "read git status of")?;
        Ok(git::fetch_git_status(
            self.runtime.as_ref(),
            container_id,
            &self.config.watcher.repo_path,
        )
        .await?)
    }

    /// Stage all changes, commit and push the current branch.
    pub async fn commit_and_push(
        &self,
        session_id: &str,
        message: &str,
    ) -> SessionResult<CommitOutcome> {
        if message.trim().is_empty() {
            return Err(SessionError::Validation(
                "commit message is required".to_string(),
            ));
        }

        let _guard = self.lock_session(session_id).await?;
        let session = self.load(session_id).await?;
        let container_id = Self::running_container(&session, "commit in")?;

        let outcome = git::commit_and_push(
            self.runtime.as_ref(),
            container_id,
            &self.config.watcher.repo_path,
            message,
        )
        .await?;
        info!(
            "Session {}: committed={} pushed={}",
            session.id(),
            outcome.committed,
            outcome.pushed
        );
        Ok(outcome)
    }

    // ========================================================================
    // Startup / shutdown
    // ========================================================================

    /// Mark the ports of persisted sessions as allocated. Returns the number
    /// of pairs reserved.
    ///
    /// Records stuck in `Initializing`/`Starting` for longer than
    /// `stale_start_after` belong to a creation that never finished; their
    /// container is removed and they are failed so they can be deleted.
    pub async fn restore_allocations(&self) -> SessionResult<usize> {
        let sessions = self.store.find_all(&SessionFilter::default()).await?;
        let total = sessions.len();
        let mut reserved = 0;

        for mut session in sessions {
            if self.is_stale_start(&session) {
                self.fail_stale_start(&mut session).await;
            }
            let Some(ports) = session.ports() else {
                continue;
            };
            if self.allocator.reserve_pair(&ports).await {
                reserved += 1;
            } else {
                warn!(
                    "Ports {} of session {} are outside the pool or already taken",
                    ports,
                    session.id()
                );
            }
        }

        info!(
            "Restored {} port pair(s) from {} persisted session(s)",
            reserved, total
        );
        Ok(reserved)
    }

    fn is_stale_start(&self, session: &Session) -> bool {
        matches!(
            session.status(),
            SessionStatus::Initializing | SessionStatus::Starting
        ) && Utc::now()
            .signed_duration_since(session.updated_at())
            .to_std()
            .is_ok_and(|age| age >= self.config.stale_start_after)
    }

    async fn fail_stale_start(&self, session: &mut Session) {
        warn!(
            "Session {} left in status {} since {}; marking it as failed",
            session.id(),
            session.status(),
            session.updated_at()
        );
        match (session.container_id().map(str::to_string), session.ports()) {
            (Some(container_id), Some(ports)) => {
                self.discard_container(session, &container_id, ports).await;
            }
            _ => {
                session.mark_as_error();
                self.save_compensated(session).await;
            }
        }
    }

    /// Attach watchers to every running session. Returns how many started.
    pub async fn resume_watchers(&self) -> SessionResult<usize> {
        let running = self
            .store
            .find_all(&SessionFilter::with_status(SessionStatus::Running))
            .await?;
        Ok(running
            .iter()
            .filter_map(|s| s.container_id().map(|c| (s.id(), c)))
            .filter(|(id, container_id)| self.watcher.start_watching(id, container_id))
            .count())
    }

    pub fn shutdown(&self) {
        self.watcher.stop_all();
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn parse_id(session_id: &str) -> SessionResult<String> {
        Uuid::parse_str(session_id)
            .map(|id| id.to_string())
            .map_err(|_| SessionError::InvalidSessionId(session_id.to_string()))
    }

    async fn lock_session(&self, session_id: &str) -> SessionResult<OwnedMutexGuard<()>> {
        let id = Self::parse_id(session_id)?;
        let lock = self
            .locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        Ok(lock.lock_owned().await)
    }

    async fn load(&self, session_id: &str) -> SessionResult<Session> {
        let id = Self::parse_id(session_id)?;
        self.store
            .find_by_id(&id)
            .await?
            .ok_or(SessionError::NotFound(id))
    }

    fn running_container<'a>(session: &'a Session, action: &'static str) -> SessionResult<&'a str> {
        match (session.status(), session.container_id()) {
            (SessionStatus::Running, Some(container_id)) => Ok(container_id),
            (status, _) => Err(SessionError::illegal(action, status)),
        }
    }

    fn notify(&self, session: &Session) {
        self.events.emit_status_change(session.id(), session.status());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{
        ContainerError, ContainerResult, ContainerState, ExecOutput, ExecStream,
    };
    use crate::session::store::InMemorySessionStore;
    use crate::settings::StaticSettings;
    use async_trait::async_trait;
    use crate::session::SessionRecord;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct FakeState {
        created: Vec<ContainerConfig>,
        removed: Vec<String>,
        stopped: Vec<String>,
        execs: Vec<Vec<String>>,
        streams: Vec<mpsc::Sender<String>>,
        fail_create: bool,
        never_running: bool,
        fail_remove: bool,
        fail_stop: bool,
        commit_output: Option<ExecOutput>,
    }

    #[derive(Default)]
    struct FakeRuntime {
        state: StdMutex<FakeState>,
    }

    impl FakeRuntime {
        fn with(configure: impl FnOnce(&mut FakeState)) -> Self {
            let runtime = Self::default();
            configure(&mut runtime.state.lock().unwrap());
            runtime
        }

        fn created_count(&self) -> usize {
            self.state.lock().unwrap().created.len()
        }
    }

    fn ok(stdout: &str) -> ExecOutput {
        ExecOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    #[async_trait]
    impl ContainerRuntimeApi for FakeRuntime {
        async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
            let mut state = self.state.lock().unwrap();
            if state.fail_create {
                return Err(ContainerError::RuntimeUnavailable(
                    "daemon not running".to_string(),
                ));
            }
            state.created.push(config.clone());
            Ok(format!("container-{}", state.created.len()))
        }

        async fn inspect_container(&self, container_id: &str) -> ContainerResult<ContainerInfo> {
            let state = self.state.lock().unwrap();
            if state.removed.iter().any(|id| id == container_id) {
                return Err(ContainerError::ContainerNotFound(container_id.to_string()));
            }
            Ok(ContainerInfo {
                id: container_id.to_string(),
                state: if state.never_running {
                    ContainerState::Created
                } else if state.stopped.iter().any(|id| id == container_id) {
                    ContainerState::Exited
                } else {
                    ContainerState::Running
                },
                ports: Vec::new(),
                labels: HashMap::new(),
                created_at: String::new(),
            })
        }

        async fn start_container(&self, _container_id: &str) -> ContainerResult<()> {
            Ok(())
        }

        async fn stop_container(
            &self,
            container_id: &str,
            _grace_seconds: Option<u32>,
        ) -> ContainerResult<()> {
            let mut state = self.state.lock().unwrap();
            if state.fail_stop {
                return Err(ContainerError::CommandFailed {
                    command: "stop".to_string(),
                    message: "timeout".to_string(),
                });
            }
            state.stopped.push(container_id.to_string());
            Ok(())
        }

        async fn remove_container(&self, container_id: &str, _force: bool) -> ContainerResult<()> {
            let mut state = self.state.lock().unwrap();
            if state.fail_remove {
                return Err(ContainerError::CommandFailed {
                    command: "rm".to_string(),
                    message: "device busy".to_string(),
                });
            }
            state.removed.push(container_id.to_string());
            Ok(())
        }

        async fn exec(
            &self,
            _container_id: &str,
            argv: &[&str],
            _workdir: Option<&str>,
        ) -> ContainerResult<ExecOutput> {
            let mut state = self.state.lock().unwrap();
            state.execs.push(argv.iter().map(|s| s.to_string()).collect());
            Ok(match argv {
                ["git", "status", ..] => ok(" M README.md\n"),
                ["git", "rev-parse", ..] => ok("feature\n"),
                ["git", "commit", ..] => state
                    .commit_output
                    .clone()
                    .unwrap_or_else(|| ok("[feature abc123] msg\n")),
                _ => ok(""),
            })
        }

        async fn exec_stream(
            &self,
            _container_id: &str,
            _argv: &[&str],
        ) -> ContainerResult<ExecStream> {
            let (tx, rx) = mpsc::channel(16);
            self.state.lock().unwrap().streams.push(tx);
            Ok(ExecStream::new(rx, CancellationToken::new()))
        }

        async fn ping(&self) -> ContainerResult<()> {
            Ok(())
        }
    }

    struct AlwaysReady;

    #[async_trait]
    impl TerminalProbe for AlwaysReady {
        async fn is_ready(&self, _port: u16) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct RecordingEvents {
        statuses: StdMutex<Vec<(String, SessionStatus)>>,
    }

    impl RecordingEvents {
        fn statuses_for(&self, session_id: &str) -> Vec<SessionStatus> {
            self.statuses
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _)| id == session_id)
                .map(|(_, s)| *s)
                .collect()
        }
    }

    impl SessionEvents for RecordingEvents {
        fn emit_status_change(&self, session_id: &str, status: SessionStatus) {
            self.statuses
                .lock()
                .unwrap()
                .push((session_id.to_string(), status));
        }

        fn emit_git_status_change(&self, _session_id: &str, _status: &GitStatus) {}
    }

    struct Harness {
        service: SessionService,
        runtime: Arc<FakeRuntime>,
        store: Arc<InMemorySessionStore>,
        events: Arc<RecordingEvents>,
    }

    fn test_config() -> SessionServiceConfig {
        SessionServiceConfig {
            port_range: PortRange::new(7681, 7684).unwrap(),
            readiness: ReadinessConfig {
                poll_interval: Duration::from_millis(1),
                max_attempts: 3,
                ..Default::default()
            },
            watcher: WatcherConfig {
                repo_wait_attempts: 1,
                repo_wait_interval: Duration::from_millis(1),
                debounce: Duration::from_millis(10),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn harness_with(runtime: FakeRuntime, config: SessionServiceConfig) -> Harness {
        let runtime = Arc::new(runtime);
        let store = Arc::new(InMemorySessionStore::new());
        let events = Arc::new(RecordingEvents::default());
        let settings = StaticSettings(GlobalSettings {
            ssh_private_key: Some("KEY".to_string()),
            claude_token: Some("token".to_string()),
            git_user_name: Some("Default Dev".to_string()),
            git_user_email: Some("dev@example.com".to_string()),
        });
        let service = SessionService::new(
            config,
            runtime.clone(),
            store.clone(),
            Arc::new(settings),
            events.clone(),
            Arc::new(AlwaysReady),
        );
        Harness {
            service,
            runtime,
            store,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeRuntime::default(), test_config())
    }

    fn request(name: &str) -> CreateSessionRequest {
        CreateSessionRequest::new(name, "https://example.com/repo.git")
    }

    #[tokio::test]
    async fn create_session_runs_and_persists() {
        let h = harness();
        let session = h.service.create_session(request("alpha")).await.unwrap();

        assert_eq!(session.status(), SessionStatus::Running);
        assert_eq!(session.ports().unwrap().ports(), [7681, 7682]);
        assert_eq!(session.container_id(), Some("container-1"));
        assert!(session.config().has_ssh_key);
        assert_eq!(session.config().branch, "main");
        assert_eq!(session.config().git_user_name.as_deref(), Some("Default Dev"));

        let stored = h.store.find_by_id(session.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), SessionStatus::Running);
        assert_eq!(
            h.events.statuses_for(session.id()),
            vec![SessionStatus::Starting, SessionStatus::Running]
        );
        assert!(h.service.watcher().is_watching(session.id()));
    }

    #[tokio::test]
    async fn container_spec_carries_ports_secrets_and_labels() {
        let h = harness();
        let mut req = request("alpha");
        req.git_user_name = Some("Override".to_string());
        req.terminal_mode = Some(TerminalMode::Single);
        let session = h.service.create_session(req).await.unwrap();

        let state = h.runtime.state.lock().unwrap();
        let created = &state.created[0];
        assert_eq!(created.ports.len(), 2);
        assert_eq!(created.ports[0].host_port, created.ports[0].container_port);
        assert_eq!(created.env["GIT_USER_NAME"], "Override");
        assert_eq!(created.env["SSH_PRIVATE_KEY"], "KEY");
        assert_eq!(created.env["CLAUDE_CODE_OAUTH_TOKEN"], "token");
        assert_eq!(created.env["TERMINAL_MODE"], "single");
        assert_eq!(created.labels[SESSION_ID_LABEL], session.id());
        assert!(created.name.as_deref().unwrap().starts_with("termbay-"));
    }

    #[tokio::test]
    async fn create_failure_releases_ports_and_records_error() {
        let h = harness_with(FakeRuntime::with(|s| s.fail_create = true), test_config());
        let err = h.service.create_session(request("alpha")).await.unwrap_err();
        let (session_id, source) = match err {
            SessionError::SessionCreateFailed { session_id, source } => (session_id, source),
            other => panic!("unexpected error: {other:?}"),
        };
        assert!(source.is_unavailable());

        assert_eq!(h.service.allocator().available_count().await, 4);
        let stored = h.store.find_by_id(&session_id).await.unwrap().unwrap();
        assert_eq!(stored.status(), SessionStatus::Error);
        assert!(stored.ports().is_none());
        assert_eq!(h.events.statuses_for(&session_id), vec![SessionStatus::Error]);
    }

    #[tokio::test]
    async fn readiness_timeout_removes_container_and_releases_ports() {
        let h = harness_with(FakeRuntime::with(|s| s.never_running = true), test_config());
        let err = h.service.create_session(request("alpha")).await.unwrap_err();
        let session_id = match err {
            SessionError::ContainerStartTimeout { session_id, .. } => session_id,
            other => panic!("unexpected error: {other:?}"),
        };

        let stored = h.store.find_by_id(&session_id).await.unwrap().unwrap();
        assert_eq!(stored.status(), SessionStatus::Error);
        assert!(stored.container_id().is_none());
        assert!(stored.ports().is_none());
        assert_eq!(h.runtime.state.lock().unwrap().removed, vec!["container-1"]);
        assert_eq!(h.service.allocator().available_count().await, 4);
        assert_eq!(
            h.events.statuses_for(&session_id),
            vec![SessionStatus::Starting, SessionStatus::Error]
        );
    }

    #[tokio::test]
    async fn removal_failure_does_not_mask_readiness_timeout() {
        let h = harness_with(
            FakeRuntime::with(|s| {
                s.never_running = true;
                s.fail_remove = true;
            }),
            test_config(),
        );
        let err = h.service.create_session(request("alpha")).await.unwrap_err();
        assert!(matches!(err, SessionError::ContainerStartTimeout { .. }));
        assert_eq!(h.service.allocator().available_count().await, 4);
    }

    #[tokio::test]
    async fn limit_is_enforced_before_any_allocation() {
        let config = SessionServiceConfig {
            max_sessions: 1,
            ..test_config()
        };
        let h = harness_with(FakeRuntime::default(), config);
        h.service.create_session(request("alpha")).await.unwrap();

        let err = h.service.create_session(request("beta")).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::LimitExceeded { active: 1, max: 1 }
        ));
        assert_eq!(h.runtime.created_count(), 1);
        assert_eq!(h.service.allocator().available_count().await, 2);
    }

    #[tokio::test]
    async fn failed_sessions_do_not_count_towards_limit() {
        let config = SessionServiceConfig {
            max_sessions: 1,
            ..test_config()
        };
        let h = harness_with(FakeRuntime::with(|s| s.fail_create = true), config);
        assert!(h.service.create_session(request("alpha")).await.is_err());

        h.runtime.state.lock().unwrap().fail_create = false;
        h.service.create_session(request("beta")).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_request_is_rejected() {
        let h = harness();
        let err = h
            .service
            .create_session(CreateSessionRequest::new(" ", "https://example.com/r.git"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));
        assert_eq!(h.runtime.created_count(), 0);
    }

    #[tokio::test]
    async fn stop_then_stop_again_is_illegal() {
        let h = harness();
        let session = h.service.create_session(request("alpha")).await.unwrap();

        let stopped = h.service.stop_session(session.id()).await.unwrap();
        assert_eq!(stopped.status(), SessionStatus::Stopped);
        assert!(!h.service.watcher().is_watching(session.id()));

        let err = h.service.stop_session(session.id()).await.unwrap_err();
        assert!(matches!(err, SessionError::IllegalTransition(_)));
    }

    #[tokio::test]
    async fn stop_failure_leaves_session_running() {
        let h = harness();
        let session = h.service.create_session(request("alpha")).await.unwrap();
        h.runtime.state.lock().unwrap().fail_stop = true;

        let err = h.service.stop_session(session.id()).await.unwrap_err();
        assert!(matches!(err, SessionError::Runtime(_)));
        let stored = h.store.find_by_id(session.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), SessionStatus::Running);
    }

    #[tokio::test]
    async fn delete_requires_stopped_or_error() {
        let h = harness();
        let session = h.service.create_session(request("alpha")).await.unwrap();

        let err = h.service.delete_session(session.id()).await.unwrap_err();
        assert!(matches!(err, SessionError::IllegalTransition(_)));

        h.service.stop_session(session.id()).await.unwrap();
        h.service.delete_session(session.id()).await.unwrap();

        assert!(h.store.find_by_id(session.id()).await.unwrap().is_none());
        assert_eq!(h.service.allocator().available_count().await, 4);
        assert_eq!(h.runtime.state.lock().unwrap().removed, vec!["container-1"]);

        let err = h.service.delete_session(session.id()).await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[tokio::test]
    async fn failed_delete_can_be_retried() {
        let h = harness();
        let session = h.service.create_session(request("alpha")).await.unwrap();
        h.service.stop_session(session.id()).await.unwrap();

        h.runtime.state.lock().unwrap().fail_remove = true;
        assert!(h.service.delete_session(session.id()).await.is_err());
        assert!(h.store.find_by_id(session.id()).await.unwrap().is_some());

        h.runtime.state.lock().unwrap().fail_remove = false;
        h.service.delete_session(session.id()).await.unwrap();
        assert_eq!(h.service.allocator().available_count().await, 4);
    }

    #[tokio::test]
    async fn start_of_stopped_session_is_not_implemented() {
        let h = harness();
        let session = h.service.create_session(request("alpha")).await.unwrap();

        let err = h.service.start_session(session.id()).await.unwrap_err();
        assert!(matches!(err, SessionError::IllegalTransition(_)));

        h.service.stop_session(session.id()).await.unwrap();
        let err = h.service.start_session(session.id()).await.unwrap_err();
        assert!(matches!(err, SessionError::NotImplemented(_)));
    }

    #[tokio::test]
    async fn restart_recreates_session_with_same_config() {
        let h = harness();
        let mut req = request("alpha");
        req.branch = Some("develop".to_string());
        let old = h.service.create_session(req).await.unwrap();

        let new = h.service.restart_session(old.id()).await.unwrap();
        assert_ne!(new.id(), old.id());
        assert_eq!(new.name(), "alpha");
        assert_eq!(new.config(), old.config());
        assert_eq!(new.status(), SessionStatus::Running);
        assert_eq!(new.ports(), old.ports());

        assert!(h.store.find_by_id(old.id()).await.unwrap().is_none());
        let state = h.runtime.state.lock().unwrap();
        assert_eq!(state.stopped, vec!["container-1"]);
        assert_eq!(state.removed, vec!["container-1"]);
    }

    #[tokio::test]
    async fn malformed_ids_are_rejected() {
        let h = harness();
        let err = h.service.stop_session("not-a-uuid").await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidSessionId(_)));

        let missing = Uuid::new_v4().to_string();
        let err = h.service.get_session_info(&missing).await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[tokio::test]
    async fn session_info_touches_and_inspects() {
        let h = harness();
        let session = h.service.create_session(request("alpha")).await.unwrap();
        assert!(session.last_accessed_at().is_none());

        let info = h.service.get_session_info(session.id()).await.unwrap();
        assert!(info.session.last_accessed_at().is_some());
        assert_eq!(info.container.unwrap().state, ContainerState::Running);

        let stored = h.store.find_by_id(session.id()).await.unwrap().unwrap();
        assert!(stored.last_accessed_at().is_some());
    }

    #[tokio::test]
    async fn terminal_health_and_git_status_of_running_session() {
        let h = harness();
        let session = h.service.create_session(request("alpha")).await.unwrap();

        let health = h.service.check_terminal_health(session.id()).await.unwrap();
        assert!(health.all_ready);

        let status = h.service.get_git_status(session.id()).await.unwrap();
        assert_eq!(
            status,
            GitStatus {
                has_changes: true,
                changed_file_count: 1,
                branch: "feature".to_string()
            }
        );

        h.service.stop_session(session.id()).await.unwrap();
        let err = h.service.get_git_status(session.id()).await.unwrap_err();
        assert!(matches!(err, SessionError::IllegalTransition(_)));
    }

    #[tokio::test]
    async fn commit_and_push_runs_git_sequence() {
        let h = harness();
        let session = h.service.create_session(request("alpha")).await.unwrap();

        let outcome = h
            .service
            .commit_and_push(session.id(), "Add feature")
            .await
            .unwrap();
        assert!(outcome.committed && outcome.pushed);

        let state = h.runtime.state.lock().unwrap();
        let git: Vec<&Vec<String>> = state
            .execs
            .iter()
            .filter(|argv| argv[0] == "git" && argv[1] != "status" && argv[1] != "rev-parse")
            .collect();
        assert_eq!(git[0], &vec!["git", "add", "-A"]);
        assert_eq!(git[1], &vec!["git", "commit", "-m", "Add feature"]);
        assert_eq!(git[2], &vec!["git", "push", "origin", "HEAD"]);
    }

    #[tokio::test]
    async fn commit_with_clean_tree_pushes_nothing() {
        let h = harness_with(
            FakeRuntime::with(|s| {
                s.commit_output = Some(ExecOutput {
                    stdout: "On branch main\nnothing to commit, working tree clean\n".to_string(),
                    stderr: String::new(),
                    exit_code: 1,
                })
            }),
            test_config(),
        );
        let session = h.service.create_session(request("alpha")).await.unwrap();

        let outcome = h.service.commit_and_push(session.id(), "noop").await.unwrap();
        assert!(!outcome.committed);
        assert!(!outcome.pushed);

        let err = h.service.commit_and_push(session.id(), "  ").await.unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));
    }

    #[tokio::test]
    async fn restore_allocations_reserves_persisted_ports() {
        let h = harness();
        let session = h.service.create_session(request("alpha")).await.unwrap();
        h.service.stop_session(session.id()).await.unwrap();

        // A fresh service over the same store starts with an empty pool.
        let fresh = SessionService::new(
            test_config(),
            h.runtime.clone(),
            h.store.clone(),
            Arc::new(StaticSettings::default()),
            h.events.clone(),
            Arc::new(AlwaysReady),
        );
        assert_eq!(fresh.restore_allocations().await.unwrap(), 1);
        assert_eq!(fresh.allocator().available_count().await, 2);

        let next = fresh.create_session(request("beta")).await.unwrap();
        assert_eq!(next.ports().unwrap().ports(), [7683, 7684]);
    }

    #[tokio::test]
    async fn resume_watchers_attaches_to_running_sessions_only() {
        let h = harness();
        let running = h.service.create_session(request("alpha")).await.unwrap();
        let stopped = h.service.create_session(request("beta")).await.unwrap();
        h.service.stop_session(stopped.id()).await.unwrap();

        let fresh = SessionService::new(
            test_config(),
            h.runtime.clone(),
            h.store.clone(),
            Arc::new(StaticSettings::default()),
            h.events.clone(),
            Arc::new(AlwaysReady),
        );
        assert_eq!(fresh.resume_watchers().await.unwrap(), 1);
        assert!(fresh.watcher().is_watching(running.id()));
        assert!(!fresh.watcher().is_watching(stopped.id()));
        fresh.shutdown();
        assert_eq!(fresh.watcher().watched_count(), 0);
    }

    /// In-memory store whose n-th save fails.
    struct FlakySaveStore {
        inner: InMemorySessionStore,
        saves: AtomicUsize,
        fail_on: usize,
    }

    impl FlakySaveStore {
        fn failing_on(fail_on: usize) -> Self {
            Self {
                inner: InMemorySessionStore::new(),
                saves: AtomicUsize::new(0),
                fail_on,
            }
        }
    }

    #[async_trait]
    impl SessionStore for FlakySaveStore {
        async fn save(&self, session: &Session) -> anyhow::Result<()> {
            if self.saves.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
                anyhow::bail!("disk full");
            }
            self.inner.save(session).await
        }

        async fn find_by_id(&self, id: &str) -> anyhow::Result<Option<Session>> {
            self.inner.find_by_id(id).await
        }

        async fn find_all(&self, filter: &SessionFilter) -> anyhow::Result<Vec<Session>> {
            self.inner.find_all(filter).await
        }

        async fn delete(&self, id: &str) -> anyhow::Result<bool> {
            self.inner.delete(id).await
        }
    }

    #[tokio::test]
    async fn failed_running_save_discards_container() {
        let runtime = Arc::new(FakeRuntime::default());
        // Save #1 is the Starting checkpoint, save #2 records Running.
        let store = Arc::new(FlakySaveStore::failing_on(2));
        let service = SessionService::new(
            test_config(),
            runtime.clone(),
            store.clone(),
            Arc::new(StaticSettings::default()),
            Arc::new(RecordingEvents::default()),
            Arc::new(AlwaysReady),
        );

        let err = service.create_session(request("alpha")).await.unwrap_err();
        assert!(matches!(err, SessionError::Store(_)), "unexpected error: {err:?}");

        let sessions = store.find_all(&SessionFilter::default()).await.unwrap();
        assert_eq!(sessions.len(), 1);
        let failed = &sessions[0];
        assert_eq!(failed.status(), SessionStatus::Error);
        assert!(failed.container_id().is_none());
        assert!(failed.ports().is_none());
        assert_eq!(service.allocator().available_count().await, 4);
        assert_eq!(runtime.state.lock().unwrap().removed, vec!["container-1"]);
        assert!(!service.watcher().is_watching(failed.id()));

        service.delete_session(failed.id()).await.unwrap();
        assert!(store.find_all(&SessionFilter::default()).await.unwrap().is_empty());
    }

    fn starting_record(age: chrono::TimeDelta, container_id: &str, ports: [u16; 2]) -> Session {
        let at = Utc::now() - age;
        Session::restore(SessionRecord {
            id: Uuid::new_v4().to_string(),
            name: "stuck".to_string(),
            config: SessionConfig {
                repo_url: "https://example.com/repo.git".to_string(),
                branch: "main".to_string(),
                git_user_name: None,
                git_user_email: None,
                has_ssh_key: false,
                terminal_mode: TerminalMode::Dual,
            },
            status: SessionStatus::Starting,
            container_id: Some(container_id.to_string()),
            ports: Some(PortPair::new(ports[0], ports[1], &test_config().port_range).unwrap()),
            created_at: at,
            updated_at: at,
            last_accessed_at: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn restore_fails_abandoned_starting_sessions() {
        let h = harness();
        let stuck = starting_record(chrono::TimeDelta::hours(1), "container-stuck", [7681, 7682]);
        let recent = starting_record(chrono::TimeDelta::zero(), "container-new", [7683, 7684]);
        h.store.save(&stuck).await.unwrap();
        h.store.save(&recent).await.unwrap();

        assert_eq!(h.service.restore_allocations().await.unwrap(), 1);

        let failed = h.store.find_by_id(stuck.id()).await.unwrap().unwrap();
        assert_eq!(failed.status(), SessionStatus::Error);
        assert!(failed.container_id().is_none());
        assert!(h.service.allocator().is_available(7681).await);
        assert!(!h.service.allocator().is_available(7683).await);
        assert_eq!(h.runtime.state.lock().unwrap().removed, vec!["container-stuck"]);

        let untouched = h.store.find_by_id(recent.id()).await.unwrap().unwrap();
        assert_eq!(untouched.status(), SessionStatus::Starting);

        h.service.delete_session(stuck.id()).await.unwrap();
        assert!(h.store.find_by_id(stuck.id()).await.unwrap().is_none());
    }
}
