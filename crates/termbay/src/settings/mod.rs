//! Global session defaults and secrets.
//!
//! Read once per session creation. Values are injected into the container and
//! never stored on the session record.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};

/// Settings shared by every session.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    pub ssh_private_key: Option<String>,
    pub claude_token: Option<String>,
    pub git_user_name: Option<String>,
    pub git_user_email: Option<String>,
}

fn redacted(value: &Option<String>) -> &'static str {
    if value.is_some() { "<redacted>" } else { "<unset>" }
}

impl std::fmt::Debug for GlobalSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalSettings")
            .field("ssh_private_key", &redacted(&self.ssh_private_key))
            .field("claude_token", &redacted(&self.claude_token))
            .field("git_user_name", &self.git_user_name)
            .field("git_user_email", &self.git_user_email)
            .finish()
    }
}

#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn get(&self) -> Result<GlobalSettings>;
}

/// Fixed settings, mostly for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct StaticSettings(pub GlobalSettings);

#[async_trait]
impl SettingsProvider for StaticSettings {
    async fn get(&self) -> Result<GlobalSettings> {
        Ok(self.0.clone())
    }
}

/// Settings read from a TOML file on every call, so edits apply to the next
/// session without a restart. A missing file yields empty settings.
#[derive(Debug, Clone)]
pub struct FileSettings {
    path: PathBuf,
}

impl FileSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SettingsProvider for FileSettings {
    async fn get(&self) -> Result<GlobalSettings> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings file at {}", self.path.display());
                return Ok(GlobalSettings::default());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("reading settings file {}", self.path.display()));
            }
        };

        toml::from_str(&contents)
            .with_context(|| format!("parsing settings file {}", self.path.display()))
    }
}
