//! Session change notifications.
//!
//! The core only emits events; fan-out to interested observers happens in
//! whatever sits behind [`SessionEvents`]. [`EventHub`] is the in-process
//! implementation, backed by a broadcast channel.

use log::trace;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::git::GitStatus;
use crate::session::SessionStatus;

/// Size of the broadcast channel for events.
const EVENT_BUFFER_SIZE: usize = 256;

/// Events emitted by the session core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A session moved to a new lifecycle status.
    StatusChanged {
        session_id: String,
        status: SessionStatus,
    },

    /// The repository inside a running session changed observably.
    GitStatusChanged {
        session_id: String,
        status: GitStatus,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::StatusChanged { session_id, .. }
            | SessionEvent::GitStatusChanged { session_id, .. } => session_id,
        }
    }
}

/// Notification collaborator. Fire-and-forget: no acknowledgement, no
/// ordering across sessions.
pub trait SessionEvents: Send + Sync {
    fn emit_status_change(&self, session_id: &str, status: SessionStatus);

    fn emit_git_status_change(&self, session_id: &str, status: &GitStatus);
}

/// Broadcast hub for session events.
#[derive(Debug, Clone)]
pub struct EventHub {
    event_tx: broadcast::Sender<SessionEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self { event_tx }
    }

    /// Subscribe to all events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is fine; events are not buffered for late joiners.
        if self.event_tx.send(event).is_err() {
            trace!("No subscribers for session event");
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionEvents for EventHub {
    fn emit_status_change(&self, session_id: &str, status: SessionStatus) {
        self.publish(SessionEvent::StatusChanged {
            session_id: session_id.to_string(),
            status,
        });
    }

    fn emit_git_status_change(&self, session_id: &str, status: &GitStatus) {
        self.publish(SessionEvent::GitStatusChanged {
            session_id: session_id.to_string(),
            status: status.clone(),
        });
    }
}
