use crate::agent::RunId;

/// Errors raised by a transport adapter.
///
/// Most variants are fatal to the physical connection and are handed to the
/// coordinator's reconnect policy. `Malformed` is scoped to a single event and
/// never affects the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The connection could not be established (refused, DNS, timeout).
    #[error("connect failed: {message}")]
    Connect { message: String },
    /// The backend answered the open request with a non-success status.
    #[error("backend responded with status {code}: {body}")]
    Status { code: u16, body: String },
    /// Reading from an established connection failed.
    #[error("stream read failed: {message}")]
    Stream { message: String },
    /// A single event could not be decoded.
    #[error("malformed event: {message}")]
    Malformed { message: String },
    /// The connection closed before the run completed.
    #[error("stream ended before run completion")]
    Ended,
    /// Adapter configuration is unusable (bad URL, client build failure).
    #[error("transport config error: {0}")]
    Config(String),
}

impl TransportError {
    /// Creates a connect-level error.
    pub fn connect(message: impl Into<String>) -> Self {
        Self::Connect {
            message: message.into(),
        }
    }

    /// Creates a stream read error.
    pub fn stream(message: impl Into<String>) -> Self {
        Self::Stream {
            message: message.into(),
        }
    }

    /// Creates a per-event decoding error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    /// Returns true when the error ends the physical connection.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Malformed { .. })
    }

    /// Returns true when reconnecting may succeed.
    ///
    /// Client errors (other than request timeout and rate limiting) and
    /// configuration errors are explicit open failures.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connect { .. } | Self::Stream { .. } | Self::Ended => true,
            Self::Status { code, .. } => *code >= 500 || *code == 408 || *code == 429,
            Self::Malformed { .. } => true,
            Self::Config(_) => false,
        }
    }
}

/// Failure of a selection request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    /// The run id does not match the active or just-completed run.
    #[error("no active run: {run_id}")]
    NoActiveRun { run_id: RunId },
    /// Input failed validation before any outbound call.
    #[error("validation error: {0}")]
    Validation(String),
    /// Backend refused the selection.
    #[error("selection rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
    /// Outbound call failed at the transport level.
    #[error("selection transport error: {0}")]
    Transport(String),
}

/// Errors returned by the coordinator control surface.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    /// Invalid caller input.
    #[error("validation error: {0}")]
    Validation(String),
    /// Invalid coordinator configuration.
    #[error("config error: {0}")]
    Config(String),
    /// The dispatch loop is no longer running.
    #[error("coordinator dispatch loop has shut down")]
    Closed,
}

/// Invalid configuration value read from the environment.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A required variable is unset or blank.
    #[error("missing {0}")]
    Missing(&'static str),
    /// A variable is set but cannot be parsed.
    #[error("invalid {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

impl From<ConfigError> for CoordinatorError {
    fn from(value: ConfigError) -> Self {
        CoordinatorError::Config(value.to_string())
    }
}
