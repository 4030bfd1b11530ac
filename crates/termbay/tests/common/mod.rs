//! Test utilities and common setup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use termbay::container::{
    ContainerConfig, ContainerError, ContainerInfo, ContainerResult, ContainerRuntimeApi,
    ContainerState, ExecOutput, ExecStream,
};
use termbay::db::Database;
use termbay::events::EventHub;
use termbay::ports::PortRange;
use termbay::session::{
    ReadinessConfig, SessionService, SessionServiceConfig, SqliteSessionStore, TerminalProbe,
};
use termbay::settings::{GlobalSettings, StaticSettings};
use termbay::watcher::WatcherConfig;

/// What the fake engine has been asked to do, and how it should misbehave.
#[derive(Default)]
pub struct EngineState {
    pub created: Vec<ContainerConfig>,
    pub inspected: usize,
    pub stopped: Vec<String>,
    pub removed: Vec<String>,
    pub fail_create: bool,
    pub never_running: bool,
}

/// In-process stand-in for Docker/Podman.
#[derive(Default)]
pub struct FakeEngine {
    pub state: Mutex<EngineState>,
    streams: Mutex<Vec<mpsc::Sender<String>>>,
}

impl FakeEngine {
    pub fn configure(&self, f: impl FnOnce(&mut EngineState)) {
        f(&mut self.state.lock().unwrap());
    }

    pub fn created_count(&self) -> usize {
        self.state.lock().unwrap().created.len()
    }

    /// Lifecycle calls only; watcher execs run in the background and are
    /// not counted.
    pub fn lifecycle_calls(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.created.len() + state.inspected + state.stopped.len() + state.removed.len()
    }
}

#[async_trait]
impl ContainerRuntimeApi for FakeEngine {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        let mut state = self.state.lock().unwrap();
        if state.fail_create {
            return Err(ContainerError::RuntimeUnavailable(
                "cannot connect to the engine".to_string(),
            ));
        }
        state.created.push(config.clone());
        Ok(format!("ctr-{}", state.created.len()))
    }

    async fn inspect_container(&self, container_id: &str) -> ContainerResult<ContainerInfo> {
        let mut state = self.state.lock().unwrap();
        state.inspected += 1;
        if state.removed.iter().any(|id| id == container_id) {
            return Err(ContainerError::ContainerNotFound(container_id.to_string()));
        }
        let container_state = if state.never_running {
            ContainerState::Created
        } else if state.stopped.iter().any(|id| id == container_id) {
            ContainerState::Exited
        } else {
            ContainerState::Running
        };
        Ok(ContainerInfo {
            id: container_id.to_string(),
            state: container_state,
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
        self.state
            .lock()
            .unwrap()
            .stopped
            .push(container_id.to_string());
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> ContainerResult<()> {
        self.state
            .lock()
            .unwrap()
            .removed
            .push(container_id.to_string());
        Ok(())
    }

    async fn exec(
        &self,
        _container_id: &str,
        argv: &[&str],
        _workdir: Option<&str>,
    ) -> ContainerResult<ExecOutput> {
        let stdout = match argv {
            ["git", "status", ..] => "",
            ["git", "rev-parse", ..] => "main\n",
            _ => "",
        };
        Ok(ExecOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    async fn exec_stream(&self, _container_id: &str, _argv: &[&str]) -> ContainerResult<ExecStream> {
        let (tx, rx) = mpsc::channel(16);
        self.streams.lock().unwrap().push(tx);
        Ok(ExecStream::new(rx, CancellationToken::new()))
    }

    async fn ping(&self) -> ContainerResult<()> {
        Ok(())
    }
}

pub struct ReadyProbe;

#[async_trait]
impl TerminalProbe for ReadyProbe {
    async fn is_ready(&self, _port: u16) -> bool {
        true
    }
}

pub struct TestApp {
    pub service: SessionService,
    pub engine: Arc<FakeEngine>,
    pub store: Arc<SqliteSessionStore>,
    pub events: Arc<EventHub>,
}

/// Four ports, so exactly two sessions fit.
pub fn small_pool_config() -> SessionServiceConfig {
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

/// Create a service over an in-memory SQLite store and a fake engine.
pub async fn test_app(config: SessionServiceConfig) -> TestApp {
    let db = Database::in_memory().await.unwrap();
    let store = Arc::new(SqliteSessionStore::new(db.pool().clone()));
    let engine = Arc::new(FakeEngine::default());
    let events = Arc::new(EventHub::new());
    let settings = StaticSettings(GlobalSettings {
        claude_token: Some("test-token".to_string()),
        ..Default::default()
    });

    let service = SessionService::new(
        config,
        engine.clone(),
        store.clone(),
        Arc::new(settings),
        events.clone(),
        Arc::new(ReadyProbe),
    );

    TestApp {
        service,
        engine,
        store,
        events,
    }
}
