//! Top-level error types for relaybot.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Classification of failures surfaced at the API boundary.
///
/// The kind, not the concrete error, decides whether the batch processor
/// retries and what the user ends up seeing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientTransport,
    PermanentTransport,
    LlmUnavailable,
    LlmBadResponse,
    Tool,
    WorkerUnavailable,
    Validation,
    Stuck,
}

impl ErrorKind {
    /// Whether the batch processor should retry a failure of this kind.
    ///
    /// `WorkerUnavailable` is handled by degrading to the direct chat loop,
    /// not by retrying: the worker registry is immutable for the life of the
    /// process, so a retry would walk the same failing path.
    pub fn retryable(self) -> bool {
        !matches!(
            self,
            ErrorKind::PermanentTransport
                | ErrorKind::LlmBadResponse
                | ErrorKind::Validation
                | ErrorKind::WorkerUnavailable
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::TransientTransport => "transient_transport",
            ErrorKind::PermanentTransport => "permanent_transport",
            ErrorKind::LlmUnavailable => "llm_unavailable",
            ErrorKind::LlmBadResponse => "llm_bad_response",
            ErrorKind::Tool => "tool",
            ErrorKind::WorkerUnavailable => "worker_unavailable",
            ErrorKind::Validation => "validation",
            ErrorKind::Stuck => "stuck",
        };
        f.write_str(name)
    }
}

impl Error {
    /// Classify this error, when it maps to a boundary kind.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::Transport(TransportError::Transient(_)) => Some(ErrorKind::TransientTransport),
            Error::Transport(TransportError::Permanent(_)) => Some(ErrorKind::PermanentTransport),
            Error::Transport(_) => Some(ErrorKind::TransientTransport),
            Error::Llm(LlmError::Unavailable(_)) => Some(ErrorKind::LlmUnavailable),
            Error::Llm(LlmError::BadResponse(_)) => Some(ErrorKind::LlmBadResponse),
            Error::Llm(_) => Some(ErrorKind::LlmUnavailable),
            Error::Router(RouterError::WorkerUnavailable(_)) => Some(ErrorKind::WorkerUnavailable),
            Error::Router(RouterError::InvalidPlan(_)) => Some(ErrorKind::Validation),
            Error::Session(SessionError::Stuck { .. }) => Some(ErrorKind::Stuck),
            _ => None,
        }
    }

    /// Unclassified failures default to retryable; only kinds the policy
    /// names as permanent abort the batch outright.
    pub fn retryable(&self) -> bool {
        self.kind().map(ErrorKind::retryable).unwrap_or(true)
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Transport send/edit/parse errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Retryable delivery failure (network blip, edit of a deleted message).
    #[error("transient transport error: {0}")]
    Transient(String),

    /// Non-retryable failure (bad credentials, malformed channel).
    #[error("permanent transport error: {0}")]
    Permanent(String),

    #[error("failed to parse inbound event: {0}")]
    Parse(String),

    #[error("transport does not support editing messages")]
    EditUnsupported,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// Provider unreachable or overloaded; retryable.
    #[error("llm provider unavailable: {0}")]
    Unavailable(String),

    /// Provider answered with something unusable; not retryable.
    #[error("llm returned a bad response: {0}")]
    BadResponse(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Router and worker dispatch errors.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("no worker registered for target: {0}")]
    WorkerUnavailable(String),

    #[error("invalid execution plan: {0}")]
    InvalidPlan(String),

    #[error("orchestration step {step_id} timed out after {timeout_ms}ms")]
    StepTimeout { step_id: String, timeout_ms: u64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Session state machine errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("batch {batch_id} is stuck (no heartbeat)")]
    Stuck { batch_id: crate::BatchId },

    #[error("batch state transition failed: {0}")]
    InvalidStateTransition(String),

    #[error("session actor is gone: {0}")]
    ActorGone(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
