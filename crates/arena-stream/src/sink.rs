use tokio::sync::mpsc;

use crate::agent::AgentId;
use crate::event::ConnectionState;

/// Rendering sink the coordinator delivers output into.
///
/// Calls are made from the coordinator's dispatch task, one at a time and in
/// delivery order. Implementations should return quickly.
pub trait RenderSink: Send + Sync {
    /// A paced, boundary-safe chunk of one agent's output.
    fn on_chunk(&self, agent_id: &AgentId, text: &str);
    /// An agent-scoped error marker. Errors are never paced.
    fn on_error(&self, agent_id: &AgentId, message: &str);
    /// The agent's output has been fully drained.
    fn on_complete(&self, agent_id: &AgentId);
    /// The session connection state changed.
    fn on_connection_state_change(&self, state: ConnectionState);
}

/// Owned form of a sink callback, used by [`ChannelSink`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkEvent {
    Chunk { agent_id: AgentId, text: String },
    Error { agent_id: AgentId, message: String },
    Complete { agent_id: AgentId },
    ConnectionState(ConnectionState),
}

/// Sink that forwards every callback into an unbounded channel.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    /// Creates a sink and the receiver that observes it.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: SinkEvent) {
        // Receiver dropped means nobody is rendering anymore.
        let _ = self.tx.send(event);
    }
}

impl RenderSink for ChannelSink {
    fn on_chunk(&self, agent_id: &AgentId, text: &str) {
        self.send(SinkEvent::Chunk {
            agent_id: agent_id.clone(),
            text: text.to_string(),
        });
    }

    fn on_error(&self, agent_id: &AgentId, message: &str) {
        self.send(SinkEvent::Error {
            agent_id: agent_id.clone(),
            message: message.to_string(),
        });
    }

    fn on_complete(&self, agent_id: &AgentId) {
        self.send(SinkEvent::Complete {
            agent_id: agent_id.clone(),
        });
    }

    fn on_connection_state_change(&self, state: ConnectionState) {
        self.send(SinkEvent::ConnectionState(state));
    }
}
