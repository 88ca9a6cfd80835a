//! Error types for the RLM runtime.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for RLM operations.
pub type Result<T> = std::result::Result<T, RlmError>;

/// Errors that can occur in the RLM runtime.
///
/// Most of these are recovered locally with a degraded answer; only `Config`
/// and host-triggered cancellation are surfaced to callers.
#[derive(Debug, Error)]
pub enum RlmError {
    /// Unknown runtime, malformed model reference, or invalid option.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The preferred interpreter binary is not present.
    #[error("Runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// The REPL child failed to reach its ready banner in time.
    #[error("REPL init failed: {0}")]
    Init(String),

    /// An `execute` exceeded its per-call wall-clock budget.
    #[error("Execution timed out after {0:?}")]
    ExecutionTimeout(Duration),

    /// Code raised an error in the sandbox or the child misbehaved.
    #[error("Execution error: {0}")]
    Execution(String),

    /// Root or sub model call failed.
    #[error("Model call failed: {0}")]
    ModelCall(String),

    /// The host's abort signal fired.
    #[error("Cancelled")]
    Cancelled,

    /// Filesystem or pipe error.
    #[error("I/O error: {0}")]
    Io(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl RlmError {
    /// Whether a retry could plausibly succeed.
    ///
    /// Only model-call failures are considered transient; configuration and
    /// sandbox errors will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ModelCall(_))
    }
}

impl From<std::io::Error> for RlmError {
    fn from(e: std::io::Error) -> Self {
        RlmError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for RlmError {
    fn from(e: serde_json::Error) -> Self {
        RlmError::Serialization(e.to_string())
    }
}
