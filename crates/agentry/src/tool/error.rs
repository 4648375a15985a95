//! Tool error type.

/// Error returned by a tool handler.
///
/// [`ToolError::new`] is an ordinary failure: it becomes a failed
/// [`ToolExecution`](crate::ToolExecution) and the model sees the message.
/// [`ToolError::misuse`] reports a bug in how the tool was wired up and
/// aborts the run with [`AgentError::ToolMisuse`](crate::AgentError::ToolMisuse).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ToolError {
    /// Human-readable error description.
    pub message: String,
    misuse: bool,
}

impl ToolError {
    /// A per-call failure.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            misuse: false,
        }
    }

    /// A contract violation by the tool implementation.
    pub fn misuse(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            misuse: true,
        }
    }

    /// Whether this error must abort the run.
    pub fn is_misuse(&self) -> bool {
        self.misuse
    }
}
