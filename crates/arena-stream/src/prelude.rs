//! Common imports for wiring a coordinator.
pub use crate::{
    AgentId, ArenaConfig, ChannelSink, ConnectionState, CoordinatorConfig, CoordinatorError,
    PacerConfig, PollConfig, PollTransport, PushConfig, PushTransport, RenderSink, RunId,
    SelectionError, SinkEvent, StreamCoordinator, TransportAdapter, TransportError,
};
