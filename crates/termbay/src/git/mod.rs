//! Git operations executed inside a session container.

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::container::{ContainerError, ContainerRuntimeApi, ExecOutput};

pub type GitResult<T> = Result<T, GitError>;

#[derive(Debug, Error)]
pub enum GitError {
    #[error(transparent)]
    Runtime(#[from] ContainerError),

    #[error("git {command} exited with {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("commit message cannot be empty")]
    EmptyMessage,
}

/// Observable repository state. Two snapshots are equal when all three fields
/// match, which is what change suppression compares on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitStatus {
    pub has_changes: bool,
    pub changed_file_count: usize,
    pub branch: String,
}

/// Result of [`commit_and_push`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitOutcome {
    pub committed: bool,
    pub pushed: bool,
    pub summary: String,
}

/// Number of entries in `git status --porcelain` output.
pub fn parse_porcelain(output: &str) -> usize {
    output.lines().filter(|l| !l.trim().is_empty()).count()
}

fn check(command: &str, output: ExecOutput) -> GitResult<ExecOutput> {
    if output.success() {
        Ok(output)
    } else {
        Err(GitError::CommandFailed {
            command: command.to_string(),
            exit_code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        })
    }
}

/// Query porcelain status and branch name concurrently.
pub async fn fetch_git_status(
    runtime: &dyn ContainerRuntimeApi,
    container_id: &str,
    repo_path: &str,
) -> GitResult<GitStatus> {
    let (status, branch) = tokio::join!(
        runtime.exec(
            container_id,
            &["git", "status", "--porcelain"],
            Some(repo_path)
        ),
        runtime.exec(
            container_id,
            &["git", "rev-parse", "--abbrev-ref", "HEAD"],
            Some(repo_path)
        ),
    );

    let status = check("status", status?)?;
    let branch = check("rev-parse", branch?)?;

    let changed_file_count = parse_porcelain(&status.stdout);
    Ok(GitStatus {
        has_changes: changed_file_count > 0,
        changed_file_count,
        branch: branch.stdout.trim().to_string(),
    })
}

/// Stage everything, commit with `message` and push the current branch.
///
/// A clean tree is not an error: nothing is committed or pushed.
pub async fn commit_and_push(
    runtime: &dyn ContainerRuntimeApi,
    container_id: &str,
    repo_path: &str,
    message: &str,
) -> GitResult<CommitOutcome> {
    let message = message.trim();
    if message.is_empty() {
        return Err(GitError::EmptyMessage);
    }

    check(
        "add",
        runtime
            .exec(container_id, &["git", "add", "-A"], Some(repo_path))
            .await?,
    )?;

    let commit = runtime
        .exec(
            container_id,
            &["git", "commit", "-m", message],
            Some(repo_path),
        )
        .await?;
    if !commit.success() {
        let text = format!("{}{}", commit.stdout, commit.stderr);
        if text.contains("nothing to commit") {
            debug!("Nothing to commit in container {}", container_id);
            return Ok(CommitOutcome {
                committed: false,
                pushed: false,
                summary: "nothing to commit".to_string(),
            });
        }
        check("commit", commit.clone())?;
    }

    check(
        "push",
        runtime
            .exec(
                container_id,
                &["git", "push", "origin", "HEAD"],
                Some(repo_path),
            )
            .await?,
    )?;

    Ok(CommitOutcome {
        committed: true,
        pushed: true,
        summary: commit.stdout.lines().next().unwrap_or_default().to_string(),
    })
}
