use thiserror::Error;

/// Errors surfaced to callers of the public agent API.
///
/// Locally recoverable conditions (schema mismatches, tool failures, policy
/// rejections) are fed back into the LLM context and never reach the caller;
/// everything here terminates a run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("maximum iterations exceeded")]
    MaxIterationsExceeded,

    #[error("LLM call timed out")]
    Timeout,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("run was cancelled")]
    Cancelled,

    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("failed to encode result of tool {tool}: {reason}")]
    EncodingFailed { tool: String, reason: String },

    #[error("already running")]
    AlreadyRunning,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("worker crashed")]
    WorkerCrashed,

    #[error("LLM reply did not match the tool schema: {0}")]
    SchemaInvalid(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl AgentError {
    /// Short machine-readable code, used in telemetry payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MaxIterationsExceeded => "max_iterations_exceeded",
            Self::Timeout => "timeout",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Cancelled => "cancelled",
            Self::CircuitOpen => "circuit_open",
            Self::UnknownTool(_) => "unknown_tool",
            Self::EncodingFailed { .. } => "encoding_failed",
            Self::AlreadyRunning => "already_running",
            Self::NotFound(_) => "not_found",
            Self::WorkerCrashed => "worker_crashed",
            Self::SchemaInvalid(_) => "schema_invalid",
            Self::Provider(_) => "provider",
            Self::Config(_) => "config",
        }
    }

    /// Whether the condition may be retried by the caller after a delay.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::CircuitOpen | Self::Provider(_) | Self::SchemaInvalid(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(AgentError::CircuitOpen.code(), "circuit_open");
        assert_eq!(AgentError::DeadlineExceeded.code(), "deadline_exceeded");
        assert_eq!(
            AgentError::EncodingFailed {
                tool: "run_callback".into(),
                reason: "NaN".into()
            }
            .code(),
            "encoding_failed"
        );
    }

    #[test]
    fn retriability_matches_propagation_policy() {
        assert!(AgentError::CircuitOpen.is_retriable());
        assert!(AgentError::Timeout.is_retriable());
        assert!(!AgentError::Cancelled.is_retriable());
        assert!(!AgentError::DeadlineExceeded.is_retriable());
    }
}
