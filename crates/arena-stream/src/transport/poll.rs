use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::agent::RunId;
use crate::backoff::ReconnectPolicy;
use crate::config::PollConfig;
use crate::errors::TransportError;
use crate::event::{LinkStatus, TransportEvent};
use crate::selection::{HttpSelectionBackend, SelectionBackend};

use super::wire::{decode_wire_event, parse_timestamp};
use super::{
    OpenRequest, TransportAdapter, TransportConnection, build_http_client, resume_param,
    status_error, validate_base_url,
};

/// Timestamp of the newest event already delivered.
///
/// Only events strictly newer than the watermark are admitted, so overlapping
/// poll windows never deliver an event twice.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Watermark(Option<DateTime<Utc>>);

impl Watermark {
    pub fn new(start: Option<DateTime<Utc>>) -> Self {
        Self(start)
    }

    pub fn get(&self) -> Option<DateTime<Utc>> {
        self.0
    }

    /// Filters one batch against the watermark as it stood before the batch,
    /// then advances it to the newest admitted timestamp. Untimestamped events
    /// always pass and never move the watermark.
    pub fn admit<T>(&mut self, batch: Vec<(Option<DateTime<Utc>>, T)>) -> Vec<T> {
        let floor = self.0;
        let mut admitted = Vec::with_capacity(batch.len());
        for (ts, item) in batch {
            match (ts, floor) {
                (Some(ts), Some(floor)) if ts <= floor => continue,
                (Some(ts), _) => {
                    if self.0.is_none_or(|current| ts > current) {
                        self.0 = Some(ts);
                    }
                }
                (None, _) => {}
            }
            admitted.push(item);
        }
        admitted
    }
}

/// Poll transport: periodic `since` queries against the run's event log.
pub struct PollTransport {
    client: reqwest::Client,
    base_url: String,
    config: PollConfig,
}

impl PollTransport {
    pub fn new(config: PollConfig) -> Result<Self, TransportError> {
        let base_url = validate_base_url(&config.base_url)?;
        let client = build_http_client(config.request_timeout, Some(config.request_timeout))?;
        Ok(Self {
            client,
            base_url,
            config,
        })
    }

    /// Posts the chosen agent for the current run; independent of polling.
    pub fn selection(&self) -> HttpSelectionBackend {
        HttpSelectionBackend::new(self.client.clone(), self.base_url.clone())
    }
}

#[async_trait::async_trait]
impl TransportAdapter for PollTransport {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn reconnect_policy(&self) -> ReconnectPolicy {
        self.config.policy
    }

    /// Performs the first poll eagerly so explicit failures (unknown run,
    /// bad credentials) surface as open errors rather than degraded polls.
    async fn open(&self, request: OpenRequest) -> Result<TransportConnection, TransportError> {
        let poller = Poller {
            client: self.client.clone(),
            url: format!("{}/runs/{}/events", self.base_url, request.run_id),
        };
        debug!(run_id = %request.run_id, attempt = request.attempt, "opening poll transport");
        let state = start_polling(Box::new(poller), &request, self.config.interval).await?;
        info!(run_id = %request.run_id, "poll transport connected");
        Ok(TransportConnection::new(
            request.run_id,
            Box::pin(poll_event_stream(state)),
        ))
    }

    fn selection_backend(&self) -> Option<Arc<dyn SelectionBackend>> {
        Some(Arc::new(self.selection()))
    }
}

/// One decoded entry of a poll batch, still carrying its timestamp.
type BatchEntry = (Option<DateTime<Utc>>, Result<Option<TransportEvent>, TransportError>);

/// Where poll batches come from.
#[async_trait::async_trait]
trait EventLog: Send + Sync {
    /// Events newer than `since`, or the whole log when `since` is `None`.
    async fn fetch(&self, since: Option<DateTime<Utc>>) -> Result<Vec<BatchEntry>, TransportError>;
}

struct Poller {
    client: reqwest::Client,
    url: String,
}

#[async_trait::async_trait]
impl EventLog for Poller {
    async fn fetch(&self, since: Option<DateTime<Utc>>) -> Result<Vec<BatchEntry>, TransportError> {
        let mut request = self.client.get(&self.url);
        if let Some(ts) = since.as_ref() {
            request = request.query(&[("since", resume_param(ts))]);
        }
        let response = request
            .send()
            .await
            .map_err(|e| TransportError::connect(format!("poll request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| TransportError::stream(format!("poll body unreadable: {e}")))?;
        decode_batch(&body)
    }
}

/// Decodes a poll body: a JSON array of `{"type": <event name>, ...}` objects.
pub(crate) fn decode_batch(body: &Value) -> Result<Vec<BatchEntry>, TransportError> {
    let Value::Array(items) = body else {
        return Err(TransportError::stream("poll body is not an array"));
    };
    Ok(items
        .iter()
        .map(|item| {
            let ts = item.get("timestamp").and_then(parse_timestamp);
            let decoded = match item.get("type").and_then(Value::as_str) {
                Some(name) => decode_wire_event(name, item),
                None => Err(TransportError::malformed("poll event without type")),
            };
            (ts, decoded)
        })
        .collect())
}

/// Queues the admitted events of a batch. Returns true once `run_complete` is seen.
fn enqueue_batch(
    pending: &mut VecDeque<Result<TransportEvent, TransportError>>,
    watermark: &mut Watermark,
    batch: Vec<BatchEntry>,
) -> bool {
    for decoded in watermark.admit(batch) {
        match decoded {
            Ok(Some(TransportEvent::RunComplete)) => {
                pending.push_back(Ok(TransportEvent::RunComplete));
                return true;
            }
            Ok(Some(event)) => pending.push_back(Ok(event)),
            Ok(None) => {}
            Err(err) => pending.push_back(Err(err)),
        }
    }
    false
}

struct PollState {
    log: Box<dyn EventLog>,
    run_id: RunId,
    interval: std::time::Duration,
    watermark: Watermark,
    pending: VecDeque<Result<TransportEvent, TransportError>>,
    degraded: bool,
    done: bool,
}

/// Runs the first poll. A failure here is an open failure, not a degraded poll.
async fn start_polling(
    log: Box<dyn EventLog>,
    request: &OpenRequest,
    interval: std::time::Duration,
) -> Result<PollState, TransportError> {
    let mut watermark = Watermark::new(request.resume_after);
    let first = log.fetch(watermark.get()).await?;

    let mut pending = VecDeque::new();
    pending.push_back(Ok(TransportEvent::Status(LinkStatus::Connected)));
    let done = enqueue_batch(&mut pending, &mut watermark, first);
    Ok(PollState {
        log,
        run_id: request.run_id.clone(),
        interval,
        watermark,
        pending,
        degraded: false,
        done,
    })
}

fn poll_event_stream(
    state: PollState,
) -> impl futures::Stream<Item = Result<TransportEvent, TransportError>> + Send {
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.done {
                return None;
            }
            tokio::time::sleep(state.interval).await;
            match state.log.fetch(state.watermark.get()).await {
                Ok(batch) => {
                    if state.degraded {
                        info!(run_id = %state.run_id, "poll recovered");
                        state.degraded = false;
                        state
                            .pending
                            .push_back(Ok(TransportEvent::Status(LinkStatus::Connected)));
                    }
                    state.done = enqueue_batch(&mut state.pending, &mut state.watermark, batch);
                }
                Err(err) => {
                    warn!(run_id = %state.run_id, error = %err, "poll failed; will poll again");
                    state.degraded = true;
                    state
                        .pending
                        .push_back(Ok(TransportEvent::Status(LinkStatus::Degraded {
                            reason: err.to_string(),
                        })));
                }
            }
        }
    })
}
