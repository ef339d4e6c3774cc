use chrono::{DateTime, Utc};

use crate::agent::AgentId;

/// Typed event produced by a transport adapter, ordered only by arrival.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// A text fragment for one agent. Diagnostic log payloads never get here.
    Output {
        agent_id: AgentId,
        content: String,
        timestamp: Option<DateTime<Utc>>,
    },
    /// An agent-scoped failure reported by the backend.
    Error { agent_id: AgentId, message: String },
    /// Link status synthesized by the adapter.
    Status(LinkStatus),
    /// Keep-alive.
    Heartbeat,
    /// One agent has produced all of its output.
    AgentComplete { agent_id: AgentId },
    /// The whole run has finished.
    RunComplete,
}

impl TransportEvent {
    /// Returns the discriminator used for logging.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Output { .. } => EventKind::Output,
            Self::Error { .. } => EventKind::Error,
            Self::Status(_) => EventKind::Status,
            Self::Heartbeat => EventKind::Heartbeat,
            Self::AgentComplete { .. } | Self::RunComplete => EventKind::Complete,
        }
    }

    /// Returns the backend timestamp carried by the event, if any.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Output { timestamp, .. } => *timestamp,
            _ => None,
        }
    }
}

/// Coarse event classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Output,
    Error,
    Status,
    Heartbeat,
    Complete,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Output => "output",
            Self::Error => "error",
            Self::Status => "status",
            Self::Heartbeat => "heartbeat",
            Self::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// Connection health as observed by an adapter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkStatus {
    /// The physical connection is established (or a poll succeeded).
    Connected,
    /// The link is alive but the latest request failed; the adapter keeps going.
    Degraded { reason: String },
}

/// Session connection state owned by the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal until the next `stop()` or `start()`.
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}
