//! Transport adapters owning the physical connection for one run.
//!
//! Both variants expose the same shape: `open()` yields a [`TransportConnection`]
//! whose stream carries typed [`TransportEvent`]s; dropping or closing the
//! connection tears the physical link down. Reconnect policy is only described
//! here, the coordinator owns the retry state machine.

mod classify;
pub mod poll;
pub mod push;
pub(crate) mod sse;
pub(crate) mod wire;

use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt as _;

use crate::agent::RunId;
use crate::backoff::ReconnectPolicy;
use crate::errors::TransportError;
use crate::event::TransportEvent;
use crate::selection::SelectionBackend;

pub use classify::{OutputClass, classify_output};
pub use poll::PollTransport;
pub use push::PushTransport;

/// Stream of decoded events for one connection.
///
/// Items with a non-fatal error (see [`TransportError::is_fatal`]) are single
/// malformed events; a fatal error is the last item.
pub type EventStream =
    Pin<Box<dyn futures::Stream<Item = Result<TransportEvent, TransportError>> + Send + 'static>>;

/// Parameters of one open attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenRequest {
    pub run_id: RunId,
    /// Newest event timestamp already delivered for this run, if any.
    pub resume_after: Option<DateTime<Utc>>,
    /// 0 for the first connection of a run, then the retry number.
    pub attempt: u32,
}

impl OpenRequest {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            resume_after: None,
            attempt: 0,
        }
    }
}

/// An open connection for one run.
pub struct TransportConnection {
    run_id: RunId,
    stream: EventStream,
}

impl TransportConnection {
    pub fn new(run_id: RunId, stream: EventStream) -> Self {
        Self { run_id, stream }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Returns the next event, or `None` once the connection is gone.
    pub async fn next_event(&mut self) -> Option<Result<TransportEvent, TransportError>> {
        self.stream.next().await
    }

    /// Closes the physical connection.
    pub fn close(self) {
        tracing::debug!(run_id = %self.run_id, "transport connection closed");
    }
}

/// A transport variant (push or poll) able to open run-scoped connections.
#[async_trait::async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Backoff parameters the coordinator applies when a connection fails.
    fn reconnect_policy(&self) -> ReconnectPolicy;

    /// Opens a connection for `request.run_id`.
    async fn open(&self, request: OpenRequest) -> Result<TransportConnection, TransportError>;

    /// Outbound selection call served by the same backend, when available.
    fn selection_backend(&self) -> Option<Arc<dyn SelectionBackend>> {
        None
    }
}

pub(crate) fn build_http_client(
    connect_timeout: std::time::Duration,
    request_timeout: Option<std::time::Duration>,
) -> Result<reqwest::Client, TransportError> {
    let mut builder = reqwest::Client::builder().connect_timeout(connect_timeout);
    if let Some(timeout) = request_timeout {
        builder = builder.timeout(timeout);
    }
    builder
        .build()
        .map_err(|e| TransportError::Config(format!("failed to build HTTP client: {e}")))
}

pub(crate) fn validate_base_url(base_url: &str) -> Result<String, TransportError> {
    let trimmed = base_url.trim().trim_end_matches('/');
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(TransportError::Config(format!(
            "base url must be http(s): `{base_url}`"
        )));
    }
    Ok(trimmed.to_string())
}

pub(crate) fn resume_param(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub(crate) async fn status_error(response: reqwest::Response) -> TransportError {
    let code = response.status().as_u16();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    TransportError::Status { code, body }
}
