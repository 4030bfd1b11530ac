//! Repository change watcher.
//!
//! One background task per running session follows filesystem events in the
//! container's working tree, coalesces bursts and emits a git status
//! notification only when the observable status changed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::container::ContainerRuntimeApi;
use crate::events::SessionEvents;
use crate::git::{GitStatus, fetch_git_status};

/// Paths whose churn never changes `git status`.
const EXCLUDE_PATTERN: &str = r"(node_modules|\.git/objects|\.git/logs)";

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Repository checkout inside the container.
    pub repo_path: String,
    /// Attempts to find `<repo>/.git` before giving up.
    pub repo_wait_attempts: u32,
    pub repo_wait_interval: Duration,
    /// Quiet period after the last filesystem event before refreshing.
    pub debounce: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            repo_path: "/workspace".to_string(),
            repo_wait_attempts: 15,
            repo_wait_interval: Duration::from_secs(2),
            debounce: Duration::from_secs(2),
        }
    }
}

struct WatcherHandle {
    generation: u64,
    cancel: CancellationToken,
    last_status: Arc<Mutex<Option<GitStatus>>>,
}

/// Per-session watcher registry. Clones share the same registry.
#[derive(Clone)]
pub struct RepoWatcher {
    runtime: Arc<dyn ContainerRuntimeApi>,
    events: Arc<dyn SessionEvents>,
    config: Arc<WatcherConfig>,
    watchers: Arc<Mutex<HashMap<String, WatcherHandle>>>,
    generation: Arc<AtomicU64>,
}

impl RepoWatcher {
    pub fn new(
        runtime: Arc<dyn ContainerRuntimeApi>,
        events: Arc<dyn SessionEvents>,
        config: WatcherConfig,
    ) -> Self {
        Self {
            runtime,
            events,
            config: Arc::new(config),
            watchers: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    /// Start watching a session's repository. Returns `false` if a watcher
    /// already exists for the session.
    pub fn start_watching(&self, session_id: &str, container_id: &str) -> bool {
        let Ok(mut watchers) = self.watchers.lock() else {
            warn!("Watcher registry poisoned; not watching {}", session_id);
            return false;
        };
        if watchers.contains_key(session_id) {
            debug!("Already watching session {}", session_id);
            return false;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let last_status = Arc::new(Mutex::new(None));
        watchers.insert(
            session_id.to_string(),
            WatcherHandle {
                generation,
                cancel: cancel.clone(),
                last_status: last_status.clone(),
            },
        );
        drop(watchers);

        let task = WatchTask {
            watcher: self.clone(),
            session_id: session_id.to_string(),
            container_id: container_id.to_string(),
            generation,
            cancel,
            last_status,
        };
        tokio::spawn(task.run());
        info!("Started repository watcher for session {}", session_id);
        true
    }

    /// Stop watching. Returns `false` if no watcher existed.
    pub fn stop_watching(&self, session_id: &str) -> bool {
        let handle = match self.watchers.lock() {
            Ok(mut watchers) => watchers.remove(session_id),
            Err(_) => None,
        };
        match handle {
            Some(handle) => {
                handle.cancel.cancel();
                info!("Stopped repository watcher for session {}", session_id);
                true
            }
            None => false,
        }
    }

    pub fn is_watching(&self, session_id: &str) -> bool {
        self.watchers
            .lock()
            .map(|w| w.contains_key(session_id))
            .unwrap_or(false)
    }

    pub fn watched_count(&self) -> usize {
        self.watchers.lock().map(|w| w.len()).unwrap_or(0)
    }

    /// Last status emitted for the session, if any.
    pub fn last_status(&self, session_id: &str) -> Option<GitStatus> {
        let watchers = self.watchers.lock().ok()?;
        let handle = watchers.get(session_id)?;
        handle.last_status.lock().ok()?.clone()
    }

    /// Stop every watcher (shutdown).
    pub fn stop_all(&self) {
        let handles: Vec<WatcherHandle> = match self.watchers.lock() {
            Ok(mut watchers) => watchers.drain().map(|(_, h)| h).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            handle.cancel.cancel();
        }
    }

    fn forget(&self, session_id: &str, generation: u64) {
        if let Ok(mut watchers) = self.watchers.lock()
            && watchers
                .get(session_id)
                .is_some_and(|h| h.generation == generation)
        {
            watchers.remove(session_id);
        }
    }
}

struct WatchTask {
    watcher: RepoWatcher,
    session_id: String,
    container_id: String,
    generation: u64,
    cancel: CancellationToken,
    last_status: Arc<Mutex<Option<GitStatus>>>,
}

impl WatchTask {
    async fn run(self) {
        let cancel = self.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = self.watch() => {}
        }
        self.watcher.forget(&self.session_id, self.generation);
    }

    async fn watch(&self) {
        if !self.wait_for_repo().await {
            debug!(
                "No repository in session {} after {} attempts; not watching",
                self.session_id, self.watcher.config.repo_wait_attempts
            );
            return;
        }

        let repo = self.watcher.config.repo_path.as_str();
        let argv = [
            "inotifywait",
            "-m",
            "-r",
            "-q",
            "-e",
            "modify,create,delete,move",
            "--exclude",
            EXCLUDE_PATTERN,
            repo,
        ];
        let mut stream = match self
            .watcher
            .runtime
            .exec_stream(&self.container_id, &argv)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    "Failed to start file watcher for session {}: {}",
                    self.session_id, e
                );
                return;
            }
        };

        self.refresh().await;

        let debounce = self.watcher.config.debounce;
        let mut deadline: Option<Instant> = None;
        loop {
            let pending = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                line = stream.next_line() => match line {
                    Some(_) => deadline = Some(Instant::now() + debounce),
                    None => {
                        debug!("File event stream for session {} ended", self.session_id);
                        return;
                    }
                },
                _ = pending => {
                    deadline = None;
                    self.refresh().await;
                }
            }
        }
    }

    async fn wait_for_repo(&self) -> bool {
        let config = &self.watcher.config;
        let git_dir = format!("{}/.git", config.repo_path.trim_end_matches('/'));

        for attempt in 1..=config.repo_wait_attempts {
            match self
                .watcher
                .runtime
                .exec(&self.container_id, &["test", "-d", git_dir.as_str()], None)
                .await
            {
                Ok(out) if out.success() => return true,
                Ok(_) => {}
                Err(e) => debug!(
                    "Checking {} in session {} failed: {}",
                    git_dir, self.session_id, e
                ),
            }
            if attempt < config.repo_wait_attempts {
                tokio::time::sleep(config.repo_wait_interval).await;
            }
        }
        false
    }

    async fn refresh(&self) {
        let status = match fetch_git_status(
            self.watcher.runtime.as_ref(),
            &self.container_id,
            &self.watcher.config.repo_path,
        )
        .await
        {
            Ok(status) => status,
            Err(e) => {
                warn!(
                    "Git status refresh failed for session {}: {}",
                    self.session_id, e
                );
                return;
            }
        };

        let changed = match self.last_status.lock() {
            Ok(mut last) if last.as_ref() != Some(&status) => {
                *last = Some(status.clone());
                true
            }
            _ => false,
        };
        if changed {
            debug!(
                "Git status changed for session {}: {} file(s) on {}",
                self.session_id, status.changed_file_count, status.branch
            );
            self.watcher
                .events
                .emit_git_status_change(&self.session_id, &status);
        }
    }
}
