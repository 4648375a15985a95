//! Record of a single tool invocation.

use agentry_core::{ToolCall, ToolResult};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Success-or-failure outcome of a tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    /// The tool returned a value.
    Success {
        /// Returned value.
        value: Value,
    },
    /// The tool failed, was blocked, or could not be resolved.
    Failure {
        /// Error text fed back to the model.
        error: String,
    },
}

/// One tool invocation's outcome and timing.
///
/// Exactly one record exists per requested call, including calls that a hook
/// blocked or that named an unknown tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecution {
    /// The call as executed (after any hook rewrite).
    pub tool_call: ToolCall,
    /// What happened.
    pub result: ToolOutcome,
    /// When invocation began.
    pub started_at: DateTime<Utc>,
    /// When invocation finished.
    pub completed_at: DateTime<Utc>,
}

impl ToolExecution {
    /// A successful execution.
    pub fn success(
        tool_call: ToolCall,
        value: Value,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            tool_call,
            result: ToolOutcome::Success { value },
            started_at,
            completed_at,
        }
    }

    /// A failed execution.
    pub fn failure(
        tool_call: ToolCall,
        error: impl Into<String>,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            tool_call,
            result: ToolOutcome::Failure {
                error: error.into(),
            },
            started_at,
            completed_at,
        }
    }

    /// A failure recorded without invoking anything, timestamped now.
    pub fn rejected(tool_call: ToolCall, error: impl Into<String>) -> Self {
        let now = Utc::now();
        Self::failure(tool_call, error, now, now)
    }

    /// Wall-clock time spent in the tool.
    pub fn duration(&self) -> TimeDelta {
        self.completed_at - self.started_at
    }

    /// Whether the tool returned a value.
    pub fn is_success(&self) -> bool {
        matches!(self.result, ToolOutcome::Success { .. })
    }

    /// The failure text, if any.
    pub fn error(&self) -> Option<&str> {
        match &self.result {
            ToolOutcome::Failure { error } => Some(error),
            ToolOutcome::Success { .. } => None,
        }
    }

    /// The result as fed back to the model. String values are sent as-is,
    /// anything else as compact JSON.
    pub fn to_tool_result(&self) -> ToolResult {
        let (content, is_error) = match &self.result {
            ToolOutcome::Success { value } => (value_text(value), false),
            ToolOutcome::Failure { error } => (error.clone(), true),
        };
        ToolResult {
            tool_call_id: self.tool_call.id.clone(),
            content,
            is_error,
        }
    }
}

pub(crate) fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
