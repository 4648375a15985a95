//! Engine error types.
//!
//! [`AgentError`] has two families. Runtime failures (backend errors,
//! invalid model decisions, failing phase handlers) are absorbed by the
//! pipeline and recorded in the returned state. Programming errors
//! (re-entrant runs, contract violations, tool misuse) are bugs and always
//! propagate to the caller as `Err`.

use std::fmt;

use agentry_core::LlmError;
use serde::{Deserialize, Serialize};

use crate::pipeline::Phase;

/// Everything the engine can raise.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AgentError {
    /// The inference backend failed.
    #[error("inference failed: {0}")]
    Inference(#[from] LlmError),

    /// A model decision or tool argument set was rejected.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A phase handler failed at runtime.
    #[error("{phase} handler failed: {message}")]
    Handler {
        /// Phase the handler was registered for.
        phase: Phase,
        /// What went wrong.
        message: String,
    },

    /// `run` or `iterate` was called while another run on the same agent
    /// was still active.
    #[error("agent is already running")]
    ReentrantRun,

    /// An operation was invoked with an invalid internal state.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// A tool implementation reported that it was used incorrectly.
    #[error("tool '{tool}' misused: {message}")]
    ToolMisuse {
        /// Name of the offending tool.
        tool: String,
        /// What the tool reported.
        message: String,
    },
}

impl AgentError {
    /// Returns `true` for bugs that must never be absorbed into state.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            Self::ReentrantRun | Self::ContractViolation(_) | Self::ToolMisuse { .. }
        )
    }

    /// Classifies a runtime failure for [`ErrorPolicy`](crate::ErrorPolicy)
    /// decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Inference(e) if e.is_rate_limited() => ErrorKind::RateLimit,
            Self::Inference(e) if e.is_timeout() => ErrorKind::Timeout,
            Self::Inference(_) => ErrorKind::Model,
            Self::Validation(_) => ErrorKind::Validation,
            Self::ToolMisuse { .. } => ErrorKind::Tool,
            _ => ErrorKind::Unknown,
        }
    }
}

/// Category of a runtime failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The backend failed for a reason other than rate limiting or timeout.
    Model,
    /// The backend rejected the request for rate limiting.
    RateLimit,
    /// The backend timed out.
    Timeout,
    /// A decision or argument set was invalid.
    Validation,
    /// A tool execution failed.
    Tool,
    /// Anything else.
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Model => "model",
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::Validation => "validation",
            Self::Tool => "tool",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}
