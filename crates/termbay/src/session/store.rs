//! Session persistence.
//!
//! The orchestrator only needs four operations; [`InMemorySessionStore`] and
//! [`SqliteSessionStore`] both provide them.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::{FromRow, SqlitePool};

use crate::ports::PortPair;

use super::models::{Session, SessionConfig, SessionFilter, SessionRecord};

/// Durable storage for session records. Each call is atomic on its own.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert or replace.
    async fn save(&self, session: &Session) -> Result<()>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Session>>;

    /// Matching sessions, oldest first.
    async fn find_all(&self, filter: &SessionFilter) -> Result<Vec<Session>>;

    /// Returns whether a record was removed.
    async fn delete(&self, id: &str) -> Result<bool>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, Session>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn save(&self, session: &Session) -> Result<()> {
        self.sessions
            .insert(session.id().to_string(), session.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.get(id).map(|s| s.value().clone()))
    }

    async fn find_all(&self, filter: &SessionFilter) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .sessions
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        sessions.sort_by_key(|s| s.created_at());
        Ok(sessions)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.sessions.remove(id).is_some())
    }
}

const SESSION_COLUMNS: &str = r#"
    id, name, repo_url, branch, git_user_name, git_user_email, has_ssh_key, terminal_mode,
    status, container_id, claude_port, manual_port, created_at, updated_at, last_accessed_at
"#;

#[derive(Debug, FromRow)]
struct SessionRow {
    id: String,
    name: String,
    repo_url: String,
    branch: String,
    git_user_name: Option<String>,
    git_user_email: Option<String>,
    has_ssh_key: bool,
    terminal_mode: String,
    status: String,
    container_id: Option<String>,
    claude_port: Option<i64>,
    manual_port: Option<i64>,
    created_at: String,
    updated_at: String,
    last_accessed_at: Option<String>,
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("parsing timestamp '{}'", value))?
        .with_timezone(&Utc))
}

fn parse_port(value: i64) -> Result<u16> {
    u16::try_from(value).with_context(|| format!("port {} out of range", value))
}

impl TryFrom<SessionRow> for Session {
    type Error = anyhow::Error;

    fn try_from(row: SessionRow) -> Result<Self> {
        let ports = match (row.claude_port, row.manual_port) {
            (Some(claude), Some(manual)) => Some(
                PortPair::from_stored(parse_port(claude)?, parse_port(manual)?)
                    .with_context(|| format!("session {} has an invalid port pair", row.id))?,
            ),
            (None, None) => None,
            _ => anyhow::bail!("session {} has a half-assigned port pair", row.id),
        };

        let record = SessionRecord {
            config: SessionConfig {
                repo_url: row.repo_url,
                branch: row.branch,
                git_user_name: row.git_user_name,
                git_user_email: row.git_user_email,
                has_ssh_key: row.has_ssh_key,
                terminal_mode: row
                    .terminal_mode
                    .parse()
                    .map_err(|e: String| anyhow::anyhow!(e))?,
            },
            status: row.status.parse().map_err(|e: String| anyhow::anyhow!(e))?,
            container_id: row.container_id,
            ports,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
            last_accessed_at: row
                .last_accessed_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            id: row.id,
            name: row.name,
        };

        Session::restore(record).map_err(|e| anyhow::anyhow!(e))
    }
}

/// SQLite-backed store.
#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn save(&self, session: &Session) -> Result<()> {
        let config = session.config();
        let ports = session.ports();
        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, name, repo_url, branch, git_user_name, git_user_email, has_ssh_key, terminal_mode,
                status, container_id, claude_port, manual_port, created_at, updated_at, last_accessed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                status = excluded.status,
                container_id = excluded.container_id,
                claude_port = excluded.claude_port,
                manual_port = excluded.manual_port,
                updated_at = excluded.updated_at,
                last_accessed_at = excluded.last_accessed_at
            "#,
        )
        .bind(session.id())
        .bind(session.name())
        .bind(&config.repo_url)
        .bind(&config.branch)
        .bind(&config.git_user_name)
        .bind(&config.git_user_email)
        .bind(config.has_ssh_key)
        .bind(config.terminal_mode.as_str())
        .bind(session.status().as_str())
        .bind(session.container_id())
        .bind(ports.map(|p| i64::from(p.claude_port())))
        .bind(ports.map(|p| i64::from(p.manual_port())))
        .bind(session.created_at().to_rfc3339())
        .bind(session.updated_at().to_rfc3339())
        .bind(session.last_accessed_at().map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .with_context(|| format!("saving session {}", session.id()))?;

        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Session>> {
        let query = format!("SELECT {} FROM sessions WHERE id = ?", SESSION_COLUMNS);
        let row = sqlx::query_as::<_, SessionRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching session")?;

        row.map(Session::try_from).transpose()
    }

    async fn find_all(&self, filter: &SessionFilter) -> Result<Vec<Session>> {
        let query = format!(
            r#"
            SELECT {} FROM sessions
            WHERE (?1 IS NULL OR status = ?1)
              AND (?2 IS NULL OR name = ?2)
            ORDER BY created_at ASC
            "#,
            SESSION_COLUMNS
        );
        let rows = sqlx::query_as::<_, SessionRow>(&query)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.name.as_deref())
            .fetch_all(&self.pool)
            .await
            .context("listing sessions")?;

        rows.into_iter().map(Session::try_from).collect()
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting session")?;

        Ok(result.rows_affected() > 0)
    }
}
