use std::sync::Arc;

use tracing::{info, warn};

use crate::agent::{AgentId, RunId};
use crate::errors::SelectionError;

/// Outbound "select winning agent" call.
#[async_trait::async_trait]
pub trait SelectionBackend: Send + Sync {
    async fn submit(&self, run_id: &RunId, agent_id: &AgentId) -> Result<(), SelectionError>;
}

/// Selection over HTTP: `POST {base}/runs/{run_id}/select` with `{"agentId": ...}`.
pub struct HttpSelectionBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSelectionBackend {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn url(&self, run_id: &RunId) -> String {
        format!(
            "{}/runs/{}/select",
            self.base_url.trim_end_matches('/'),
            run_id
        )
    }
}

#[async_trait::async_trait]
impl SelectionBackend for HttpSelectionBackend {
    async fn submit(&self, run_id: &RunId, agent_id: &AgentId) -> Result<(), SelectionError> {
        let response = self
            .client
            .post(self.url(run_id))
            .json(&serde_json::json!({ "agentId": agent_id }))
            .send()
            .await
            .map_err(|e| SelectionError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(SelectionError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }
}

/// Phase of the run a selection refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Active,
    /// `run_complete` was received; selection is still accepted.
    Completed,
}

/// Validates a selection against the coordinator's run and performs exactly
/// one outbound call. Never retries.
#[derive(Clone)]
pub struct SelectionGateway {
    backend: Arc<dyn SelectionBackend>,
}

impl SelectionGateway {
    pub fn new(backend: Arc<dyn SelectionBackend>) -> Self {
        Self { backend }
    }

    /// `current` is the coordinator's run (active or just completed), if any.
    pub async fn select(
        &self,
        current: Option<(&RunId, RunPhase)>,
        run_id: &RunId,
        agent_id: &AgentId,
    ) -> Result<(), SelectionError> {
        if run_id.is_blank() {
            return Err(SelectionError::Validation("run id must not be empty".into()));
        }
        if agent_id.as_str().trim().is_empty() {
            return Err(SelectionError::Validation(
                "agent id must not be empty".into(),
            ));
        }
        match current {
            Some((current_run, phase)) if current_run == run_id => {
                info!(run_id = %run_id, agent_id = %agent_id, ?phase, "submitting selection");
            }
            _ => {
                return Err(SelectionError::NoActiveRun {
                    run_id: run_id.clone(),
                });
            }
        }
        self.backend
            .submit(run_id, agent_id)
            .await
            .inspect_err(|err| warn!(run_id = %run_id, agent_id = %agent_id, error = %err, "selection failed"))
    }
}
