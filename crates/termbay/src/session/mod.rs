//! Session management module.
//!
//! Handles the lifecycle of container sessions: the aggregate and its state
//! machine, persistence, readiness probing and orchestration.

mod error;
mod models;
mod readiness;
mod service;
mod store;

pub use error::{SessionError, SessionResult};
pub use models::{
    Session, SessionConfig, SessionFilter, SessionRecord, SessionStatus, TerminalMode,
    TransitionError,
};
pub use readiness::{
    HttpTerminalProbe, ReadinessConfig, ReadinessError, TerminalHealth, TerminalProbe,
    check_terminal_health, wait_for_running,
};
pub use service::{
    CreateSessionRequest, MANAGED_LABEL, SESSION_ID_LABEL, SessionInfo, SessionService,
    SessionServiceConfig,
};
pub use store::{InMemorySessionStore, SessionStore, SqliteSessionStore};
