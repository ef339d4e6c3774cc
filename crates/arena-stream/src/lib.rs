//! Per-agent stream demultiplexing and pacing for multi-agent comparison runs.
//!
//! A backend runs several agents against the same task and reports their
//! interleaved output over one connection, either pushed as server-sent events
//! or pulled by polling. [`StreamCoordinator`] owns that connection for the
//! current run, splits the events per agent, paces each agent's text into a
//! [`RenderSink`] at a steady rate without cutting words or code fences, and
//! reconnects with capped exponential backoff when the link drops.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use arena_stream::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = PushTransport::new(PushConfig::new("http://localhost:8080"))?;
//! let (sink, mut rendered) = ChannelSink::new();
//! let coordinator = StreamCoordinator::builder()
//!     .transport(Arc::new(transport))
//!     .sink(Arc::new(sink))
//!     .build()?;
//!
//! coordinator.start("run-42").await?;
//! while let Some(event) = rendered.recv().await {
//!     if let SinkEvent::Chunk { agent_id, text } = event {
//!         print!("[{agent_id}] {text}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

/// Agent and run identifiers.
pub mod agent;
/// Capped exponential reconnect policy.
pub mod backoff;
/// Pacer, transport and environment configuration.
pub mod config;
/// Session coordinator: routing, connection state and reconnects.
pub mod coordinator;
/// Public error types.
pub mod errors;
/// Typed transport events and connection states.
pub mod event;
/// Process-wide logging setup.
pub mod observability;
/// Per-agent output pacing.
pub mod pacer;
/// Common imports for typical usage.
pub mod prelude;
/// Winner selection for the current run.
pub mod selection;
/// Rendering sink contract.
pub mod sink;
/// Push and poll transport adapters.
pub mod transport;

pub use agent::{AgentId, RunId};
pub use backoff::{Backoff, ReconnectPolicy};
pub use config::{
    ArenaConfig, BackendFlavor, CoordinatorConfig, PacerConfig, PollConfig, PushConfig,
    TransportKind,
};
pub use coordinator::{CoordinatorBuilder, SessionSnapshot, StreamCoordinator};
pub use errors::{ConfigError, CoordinatorError, SelectionError, TransportError};
pub use event::{ConnectionState, LinkStatus, TransportEvent};
pub use pacer::{Emission, PaceBuffer, Pacer, PacerOutput};
pub use selection::{HttpSelectionBackend, RunPhase, SelectionBackend, SelectionGateway};
pub use sink::{ChannelSink, RenderSink, SinkEvent};
pub use transport::{
    OpenRequest, PollTransport, PushTransport, TransportAdapter, TransportConnection,
};
