//! Error types and handling for the report service harness

use std::time::Duration;
use thiserror::Error;

/// Result type alias for harness operations
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Behavioural classification of a failure, used by the scenario runner to
/// decide between skipping, failing, and tolerating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Baseline could not be established; the scenario is skipped
    PreconditionUnmet,
    /// Docker, network or proxy failure; the suite aborts with cleanup
    InfrastructureUnavailable,
    /// A phase or operation deadline was crossed
    OperationTimeout,
    /// An entity never reached its terminal state
    ConvergenceFailure,
    /// The service under test misbehaved (5xx, unknown state, ...)
    ProtocolViolation,
    /// Transport-level or caller-visible HTTP failure
    Transport,
    /// Caller cancelled the operation
    Cancelled,
    /// Local misconfiguration or I/O
    Internal,
}

/// Harness error types
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Precondition unmet: {0}")]
    PreconditionUnmet(String),

    #[error("Infrastructure unavailable: {0}")]
    InfrastructureUnavailable(String),

    #[error("Infrastructure startup failed: {}", failures.join("; "))]
    Startup { failures: Vec<String> },

    #[error("Timeout: {operation} did not complete within {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error(
        "Convergence failure (messages must not be silently lost): {stuck_ids:?} still {last_status} after {after:?}"
    )]
    ConvergenceFailure {
        stuck_ids: Vec<String>,
        last_status: String,
        after: Duration,
    },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unexpected status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Process error: {0}")]
    Process(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HarnessError {
    /// Shorthand for a timeout on a named operation
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        HarnessError::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Map the error onto the behavioural kinds the chaos protocol reasons about
    pub fn kind(&self) -> ErrorKind {
        match self {
            HarnessError::PreconditionUnmet(_) => ErrorKind::PreconditionUnmet,
            HarnessError::InfrastructureUnavailable(_) | HarnessError::Startup { .. } => {
                ErrorKind::InfrastructureUnavailable
            }
            HarnessError::Timeout { .. } => ErrorKind::OperationTimeout,
            HarnessError::ConvergenceFailure { .. } => ErrorKind::ConvergenceFailure,
            HarnessError::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            HarnessError::UnexpectedStatus { status, .. } if *status >= 500 => {
                ErrorKind::ProtocolViolation
            }
            HarnessError::Transport(_) | HarnessError::UnexpectedStatus { .. } => {
                ErrorKind::Transport
            }
            HarnessError::Cancelled => ErrorKind::Cancelled,
            HarnessError::Process(_)
            | HarnessError::Config(_)
            | HarnessError::Io(_)
            | HarnessError::Json(_) => ErrorKind::Internal,
        }
    }

    /// Whether the error is the expected symptom of a dependency outage.
    /// Transport errors and non-success statuses are tolerated during
    /// Verify-Failure; everything else still fails the phase.
    pub fn is_expected_during_outage(&self) -> bool {
        matches!(
            self,
            HarnessError::Transport(_) | HarnessError::UnexpectedStatus { .. }
        )
    }
}

impl From<reqwest::Error> for HarnessError {
    fn from(err: reqwest::Error) -> Self {
        HarnessError::Transport(format!("HTTP request error: {}", err))
    }
}

impl From<http::header::InvalidHeaderValue> for HarnessError {
    fn from(err: http::header::InvalidHeaderValue) -> Self {
        HarnessError::Config(format!("Invalid header value: {}", err))
    }
}

impl From<toml::de::Error> for HarnessError {
    fn from(err: toml::de::Error) -> Self {
        HarnessError::Config(format!("Failed to parse config: {}", err))
    }
}

impl From<url::ParseError> for HarnessError {
    fn from(err: url::ParseError) -> Self {
        HarnessError::Config(format!("Invalid URL: {}", err))
    }
}
