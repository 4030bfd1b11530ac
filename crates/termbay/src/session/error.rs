//! Session orchestration errors.

use thiserror::Error;

use crate::container::ContainerError;
use crate::git::GitError;
use crate::ports::PortError;

use super::models::{SessionStatus, TransitionError};
use super::readiness::ReadinessError;

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("session limit reached: {active} of {max} sessions in use")]
    LimitExceeded { active: usize, max: usize },

    #[error(transparent)]
    ResourceExhausted(PortError),

    #[error("failed to create session {session_id}: {source}")]
    SessionCreateFailed {
        session_id: String,
        #[source]
        source: ContainerError,
    },

    #[error("container for session {session_id} did not start: {source}")]
    ContainerStartTimeout {
        session_id: String,
        #[source]
        source: ReadinessError,
    },

    #[error(transparent)]
    IllegalTransition(#[from] TransitionError),

    #[error("{0} is not supported")]
    NotImplemented(&'static str),

    #[error("container runtime error: {0}")]
    Runtime(#[from] ContainerError),

    #[error("git command failed: {0}")]
    GitCommandFailed(#[from] GitError),

    #[error("session store error: {0:#}")]
    Store(#[from] anyhow::Error),

    #[error("failed to read settings: {0:#}")]
    Settings(#[source] anyhow::Error),
}

impl SessionError {
    pub(crate) fn illegal(action: &'static str, from: SessionStatus) -> Self {
        SessionError::IllegalTransition(TransitionError { action, from })
    }

    /// Caller error: retrying with the same input cannot succeed.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SessionError::InvalidSessionId(_)
                | SessionError::NotFound(_)
                | SessionError::Validation(_)
                | SessionError::LimitExceeded { .. }
                | SessionError::IllegalTransition(_)
                | SessionError::NotImplemented(_)
        )
    }
}

impl From<PortError> for SessionError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::ResourceExhausted { .. } => SessionError::ResourceExhausted(err),
            other => SessionError::Validation(other.to_string()),
        }
    }
}
