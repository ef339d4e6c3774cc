//! Decoding of the named wire events shared by the push and poll transports.

use chrono::{DateTime, TimeZone as _, Utc};
use serde_json::Value;
use tracing::trace;

use crate::agent::AgentId;
use crate::errors::TransportError;
use crate::event::TransportEvent;

use super::classify::{OutputClass, classify_output};

pub(crate) const AGENT_OUTPUT: &str = "agent_output";
pub(crate) const AGENT_ERROR: &str = "agent_error";
pub(crate) const AGENT_COMPLETE: &str = "agent_complete";
pub(crate) const RUN_COMPLETE: &str = "run_complete";
pub(crate) const HEARTBEAT: &str = "heartbeat";

/// Maps one named wire event to a transport event.
///
/// `Ok(None)` means the event was decoded and deliberately suppressed
/// (diagnostic log output).
pub(crate) fn decode_wire_event(
    name: &str,
    data: &Value,
) -> Result<Option<TransportEvent>, TransportError> {
    match name {
        AGENT_OUTPUT => {
            let agent_id = agent_id(name, data)?;
            let content = match data.get("content") {
                Some(Value::String(text)) => text.clone(),
                Some(Value::Null) | None => {
                    return Err(TransportError::malformed(format!(
                        "{name} without content for agent {agent_id}"
                    )));
                }
                Some(other) => other.to_string(),
            };
            if classify_output(&content) == OutputClass::DiagnosticLog {
                trace!(agent_id = %agent_id, "suppressed diagnostic log output");
                return Ok(None);
            }
            Ok(Some(TransportEvent::Output {
                agent_id,
                content,
                timestamp: data.get("timestamp").and_then(parse_timestamp),
            }))
        }
        AGENT_ERROR => {
            let agent_id = agent_id(name, data)?;
            let message = data
                .get("error")
                .or_else(|| data.get("message"))
                .map(|v| match v {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| "agent reported an error".to_string());
            Ok(Some(TransportEvent::Error { agent_id, message }))
        }
        AGENT_COMPLETE => Ok(Some(TransportEvent::AgentComplete {
            agent_id: agent_id(name, data)?,
        })),
        RUN_COMPLETE => Ok(Some(TransportEvent::RunComplete)),
        HEARTBEAT => Ok(Some(TransportEvent::Heartbeat)),
        other => Err(TransportError::malformed(format!(
            "unknown event name `{other}`"
        ))),
    }
}

/// Parses the JSON body of a wire event. Empty bodies decode as `{}`.
pub(crate) fn parse_data(raw: &str) -> Result<Value, TransportError> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str(raw)
        .map_err(|e| TransportError::malformed(format!("invalid event JSON: {e}")))
}

fn agent_id(name: &str, data: &Value) -> Result<AgentId, TransportError> {
    match data.get("agentId").or_else(|| data.get("agent_id")) {
        Some(Value::String(id)) if !id.trim().is_empty() => Ok(AgentId::new(id.as_str())),
        Some(Value::Number(n)) => Ok(AgentId::new(n.to_string())),
        _ => Err(TransportError::malformed(format!("{name} without agentId"))),
    }
}

/// Accepts RFC 3339 strings or epoch milliseconds.
pub(crate) fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}
