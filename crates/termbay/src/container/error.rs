//! Container runtime error types.

use thiserror::Error;

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors that can occur during container operations.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The container engine could not be reached (binary missing, daemon down).
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// `run` was rejected by the engine.
    #[error("container create failed: {0}")]
    CreateFailed(String),

    /// Any other container command failed.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Container was not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Failed to parse container output.
    #[error("failed to parse container output: {0}")]
    ParseError(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    /// Whether the error means the engine itself is unreachable.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ContainerError::RuntimeUnavailable(_))
    }
}

/// Stderr fragments the docker and podman CLIs print when the daemon/socket is down.
const UNAVAILABLE_MARKERS: &[&str] = &[
    "cannot connect to the docker daemon",
    "is the docker daemon running",
    "cannot connect to podman",
    "unable to connect to podman socket",
    "connection refused",
];

/// Stderr fragments meaning the referenced container does not exist.
const NOT_FOUND_MARKERS: &[&str] = &["no such container", "no such object", "no container with"];

pub(crate) fn stderr_means_unavailable(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    UNAVAILABLE_MARKERS.iter().any(|m| lower.contains(m))
}

pub(crate) fn stderr_means_not_found(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    NOT_FOUND_MARKERS.iter().any(|m| lower.contains(m))
}
