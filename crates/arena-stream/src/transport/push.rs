use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt as _;
use futures::stream;
use tracing::{debug, info};

use crate::backoff::ReconnectPolicy;
use crate::config::PushConfig;
use crate::errors::TransportError;
use crate::event::{LinkStatus, TransportEvent};
use crate::selection::{HttpSelectionBackend, SelectionBackend};

use super::sse::{SseDecoder, SseFrame};
use super::wire::{RUN_COMPLETE, decode_wire_event, parse_data};
use super::{
    OpenRequest, TransportAdapter, TransportConnection, build_http_client, resume_param,
    status_error, validate_base_url,
};

type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static>>;

/// Push transport: one server-sent-events connection per run.
pub struct PushTransport {
    client: reqwest::Client,
    base_url: String,
    config: PushConfig,
}

impl PushTransport {
    pub fn new(config: PushConfig) -> Result<Self, TransportError> {
        let base_url = validate_base_url(&config.base_url)?;
        let client = build_http_client(config.connect_timeout, None)?;
        Ok(Self {
            client,
            base_url,
            config,
        })
    }

    fn stream_request(&self, request: &OpenRequest) -> reqwest::RequestBuilder {
        let flavor = self.config.flavor;
        let url = format!(
            "{}{}",
            self.base_url,
            flavor.stream_path(request.run_id.as_str())
        );
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(param) = flavor.run_query_param() {
            query.push((param, request.run_id.to_string()));
        }
        if let Some(ts) = request.resume_after.as_ref() {
            query.push((flavor.resume_query_param(), resume_param(ts)));
        }
        self.client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .query(&query)
    }
}

#[async_trait::async_trait]
impl TransportAdapter for PushTransport {
    fn name(&self) -> &'static str {
        "push"
    }

    fn reconnect_policy(&self) -> ReconnectPolicy {
        self.config.reconnect_policy()
    }

    async fn open(&self, request: OpenRequest) -> Result<TransportConnection, TransportError> {
        debug!(
            run_id = %request.run_id,
            attempt = request.attempt,
            flavor = ?self.config.flavor,
            "opening push stream"
        );
        let response = self
            .stream_request(&request)
            .send()
            .await
            .map_err(|e| TransportError::connect(format!("push stream request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        info!(run_id = %request.run_id, attempt = request.attempt, "push stream connected");

        let bytes: ByteStream = Box::pin(response.bytes_stream());
        Ok(TransportConnection::new(
            request.run_id,
            Box::pin(sse_event_stream(bytes, self.config.idle_timeout)),
        ))
    }

    fn selection_backend(&self) -> Option<Arc<dyn SelectionBackend>> {
        Some(Arc::new(HttpSelectionBackend::new(
            self.client.clone(),
            self.base_url.clone(),
        )))
    }
}

/// Maps one SSE frame. The `event:` name is the discriminator.
pub(crate) fn map_frame(frame: &SseFrame) -> Result<Option<TransportEvent>, TransportError> {
    let Some(name) = frame.event.as_deref() else {
        return Err(TransportError::malformed("SSE frame without event name"));
    };
    let data = parse_data(&frame.data)?;
    decode_wire_event(name, &data)
}

/// Frames arrive at least as often as heartbeats; `idle_timeout` without a
/// single byte means the link is dead even if the socket is still open.
fn sse_event_stream(
    bytes: ByteStream,
    idle_timeout: Duration,
) -> impl futures::Stream<Item = Result<TransportEvent, TransportError>> + Send {
    struct State {
        bytes: ByteStream,
        decoder: SseDecoder,
        pending: VecDeque<Result<TransportEvent, TransportError>>,
        done: bool,
    }

    let mut pending = VecDeque::new();
    pending.push_back(Ok(TransportEvent::Status(LinkStatus::Connected)));

    stream::unfold(
        State {
            bytes,
            decoder: SseDecoder::default(),
            pending,
            done: false,
        },
        move |mut state| async move {
            loop {
                if let Some(item) = state.pending.pop_front() {
                    return Some((item, state));
                }
                if state.done {
                    return None;
                }
                match tokio::time::timeout(idle_timeout, state.bytes.next()).await {
                    Err(_) => {
                        state.pending.push_back(Err(TransportError::stream(format!(
                            "no data or heartbeat within {}ms",
                            idle_timeout.as_millis()
                        ))));
                        state.done = true;
                    }
                    Ok(Some(Ok(chunk))) => {
                        for frame in state.decoder.push_chunk(&chunk) {
                            let run_complete = frame.event.as_deref() == Some(RUN_COMPLETE);
                            match map_frame(&frame) {
                                Ok(Some(event)) => state.pending.push_back(Ok(event)),
                                Ok(None) => {}
                                Err(err) => state.pending.push_back(Err(err)),
                            }
                            if run_complete {
                                // Run is over: anything after this frame is ignored.
                                state.done = true;
                                break;
                            }
                        }
                    }
                    Ok(Some(Err(e))) => {
                        state.pending.push_back(Err(TransportError::stream(format!(
                            "push stream read failed: {e}"
                        ))));
                        state.done = true;
                    }
                    Ok(None) => {
                        state.pending.push_back(Err(TransportError::Ended));
                        state.done = true;
                    }
                }
            }
        },
    )
}
