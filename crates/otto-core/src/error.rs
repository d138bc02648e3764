//! Engine error taxonomy.
//!
//! Every error carries a stable machine code (what goes on the wire and into
//! logs), a human message, and a retryable flag. Per-call errors are recovered
//! locally into tool results; per-turn errors end the turn but preserve the
//! session; fatal errors halt the supervisor with the session saved.

use thiserror::Error;

/// Errors produced by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad startup state. Fatal.
    #[error("configuration error: {0}")]
    Config(String),

    /// Tool arguments failed schema validation. Returned as a tool failure,
    /// never raised past the orchestrator.
    #[error("invalid parameters: {0}")]
    Validation(String),

    /// A tool handler failed.
    #[error("tool '{tool}' failed: {message}")]
    ToolExecution {
        tool: String,
        message: String,
        retryable: bool,
    },

    /// A tool exceeded its deadline and was cancelled.
    #[error("tool '{tool}' timed out after {timeout_secs}s")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    /// The safety gate rejected the call under the active approval policy.
    #[error("approval denied for tool '{tool}'")]
    ApprovalDenied { tool: String },

    /// A path argument escaped the session working directory.
    #[error("path traversal rejected: {path}")]
    PathTraversal { path: String },

    /// The dangerous-command scan matched.
    #[error("dangerous command rejected: {reason}")]
    DangerousCommand { reason: String },

    /// Transient provider failure (timeout, reset, 429, 5xx). Retried by the
    /// driver under the retry budget.
    #[error("transient LLM error: {0}")]
    LlmTransient(String),

    /// Non-retryable provider failure. Surfaced as `agent_error`, ends the turn.
    #[error("LLM error: {0}")]
    LlmFatal(String),

    /// The circuit breaker is open; the supervisor halts.
    #[error("circuit breaker open")]
    CircuitOpen,

    /// The rate bucket has no capacity this window.
    #[error("rate limit exceeded")]
    RateLimited,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Session exists but its idle window elapsed; it loads read-only.
    #[error("session expired: {0}")]
    SessionExpired(String),

    /// The repetition detector fired. Not a failure: the turn engine injects a
    /// breaker message and the no-progress counter ticks.
    #[error("loop detected: {0}")]
    LoopDetected(String),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Validation(_) => "invalid_parameters",
            Self::ToolExecution { .. } => "tool_error",
            Self::ToolTimeout { .. } => "timeout",
            Self::ApprovalDenied { .. } => "approval_denied",
            Self::PathTraversal { .. } => "path_traversal",
            Self::DangerousCommand { .. } => "dangerous_command",
            Self::LlmTransient(_) => "llm_transient",
            Self::LlmFatal(_) => "llm_error",
            Self::CircuitOpen => "circuit_open",
            Self::RateLimited => "rate_limited",
            Self::SessionNotFound(_) => "session_not_found",
            Self::SessionExpired(_) => "session_expired",
            Self::LoopDetected(_) => "loop_detected",
            Self::Cancelled => "cancelled",
            Self::Io(_) => "io_error",
            Self::Json(_) => "serialization_error",
        }
    }

    /// Whether the operation may be retried. Safety rejections and policy
    /// halts are never retryable.
    pub fn retryable(&self) -> bool {
        match self {
            Self::LlmTransient(_) | Self::Io(_) => true,
            Self::ToolExecution { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

/// A short id attached to error reports so a log line can be joined with the
/// event that surfaced it.
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(EngineError::RateLimited.code(), "rate_limited");
        assert_eq!(EngineError::CircuitOpen.code(), "circuit_open");
        assert_eq!(
            EngineError::ApprovalDenied {
                tool: "bash".into()
            }
            .code(),
            "approval_denied"
        );
    }

    #[test]
    fn safety_rejections_are_not_retryable() {
        assert!(!EngineError::ApprovalDenied { tool: "x".into() }.retryable());
        assert!(!EngineError::PathTraversal { path: "..".into() }.retryable());
        assert!(!EngineError::DangerousCommand {
            reason: "rm -rf /".into()
        }
        .retryable());
    }

    #[test]
    fn transient_llm_is_retryable() {
        assert!(EngineError::LlmTransient("429".into()).retryable());
        assert!(!EngineError::LlmFatal("401".into()).retryable());
    }

    #[test]
    fn trace_ids_are_short_and_unique() {
        let a = new_trace_id();
        let b = new_trace_id();
        assert_eq!(a.len(), 12);
        assert_ne!(a, b);
    }
}
