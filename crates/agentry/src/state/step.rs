//! One pass through a driver.

use agentry_core::{ChatMessage, ChatResponse, StopReason, ToolCall, Usage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ToolExecution;
use crate::error::ErrorKind;

/// What a step produced.
///
/// The ReAct driver's "thought/action" turns are `ToolExecution` steps and
/// its "final answer" turns are `FinalResponse` steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// The model requested one or more tool calls.
    ToolExecution,
    /// The model answered without requesting tools.
    FinalResponse,
    /// The step failed; see [`Step::failure`].
    Error,
}

/// Backend response metadata kept for accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceInfo {
    /// Tokens consumed.
    pub usage: Usage,
    /// Why generation ended.
    pub stop_reason: StopReason,
    /// Model that served the request.
    pub model: String,
}

impl From<&ChatResponse> for InferenceInfo {
    fn from(resp: &ChatResponse) -> Self {
        Self {
            usage: resp.usage.clone(),
            stop_reason: resp.stop_reason.clone(),
            model: resp.model.clone(),
        }
    }
}

/// Why a step failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    /// Failure category.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
}

/// Result of one pass through the driver. Built once, never modified after
/// it has been recorded in an [`ExecutionState`](super::ExecutionState).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// What the step produced.
    pub step_type: StepType,
    /// Messages sent to the backend.
    pub input_messages: Vec<ChatMessage>,
    /// Messages produced for the conversation.
    pub output_messages: Vec<ChatMessage>,
    /// Tool invocations, in request order.
    pub tool_executions: Vec<ToolExecution>,
    /// Backend response metadata, absent if the backend was never reached.
    pub inference: Option<InferenceInfo>,
    /// Reasoning text the model gave for its decision, if any.
    pub thought: Option<String>,
    /// Failure details for [`StepType::Error`] steps.
    pub failure: Option<StepFailure>,
    /// When the step began.
    pub started_at: DateTime<Utc>,
    /// When the step finished.
    pub completed_at: DateTime<Utc>,
}

impl Step {
    /// A step whose tool calls were executed.
    pub fn tool_execution(
        input_messages: Vec<ChatMessage>,
        output_messages: Vec<ChatMessage>,
        tool_executions: Vec<ToolExecution>,
        inference: Option<InferenceInfo>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            step_type: StepType::ToolExecution,
            input_messages,
            output_messages,
            tool_executions,
            inference,
            thought: None,
            failure: None,
            started_at,
            completed_at: Utc::now(),
        }
    }

    /// A terminal answer.
    pub fn final_response(
        input_messages: Vec<ChatMessage>,
        output_messages: Vec<ChatMessage>,
        inference: Option<InferenceInfo>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            step_type: StepType::FinalResponse,
            input_messages,
            output_messages,
            tool_executions: Vec::new(),
            inference,
            thought: None,
            failure: None,
            started_at,
            completed_at: Utc::now(),
        }
    }

    /// A failed step.
    pub fn error(
        kind: ErrorKind,
        message: impl Into<String>,
        input_messages: Vec<ChatMessage>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            step_type: StepType::Error,
            input_messages,
            output_messages: Vec::new(),
            tool_executions: Vec::new(),
            inference: None,
            thought: None,
            failure: Some(StepFailure {
                kind,
                message: message.into(),
            }),
            started_at,
            completed_at: Utc::now(),
        }
    }

    /// Sets the output messages.
    #[must_use]
    pub fn with_outputs(mut self, output_messages: Vec<ChatMessage>) -> Self {
        self.output_messages = output_messages;
        self
    }

    /// Sets the inference metadata.
    #[must_use]
    pub fn with_inference(mut self, inference: InferenceInfo) -> Self {
        self.inference = Some(inference);
        self
    }

    /// Sets the model's reasoning text.
    #[must_use]
    pub fn with_thought(mut self, thought: impl Into<String>) -> Self {
        self.thought = Some(thought.into());
        self
    }

    /// Whether this is a terminal answer.
    pub fn is_final(&self) -> bool {
        self.step_type == StepType::FinalResponse
    }

    /// Whether the step failed.
    pub fn is_error(&self) -> bool {
        self.step_type == StepType::Error
    }

    /// Number of tool executions that did not succeed.
    pub fn failed_tool_count(&self) -> usize {
        self.tool_executions
            .iter()
            .filter(|e| !e.is_success())
            .count()
    }

    /// The tool calls this step executed.
    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.tool_executions.iter().map(|e| &e.tool_call)
    }

    /// Tokens consumed, zero if the backend was never reached.
    pub fn usage(&self) -> Usage {
        self.inference
            .as_ref()
            .map(|i| i.usage.clone())
            .unwrap_or_default()
    }

    /// Converts to a plain JSON record.
    pub fn to_record(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Rebuilds a step from [`to_record`](Self::to_record) output.
    pub fn from_record(record: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(record)
    }
}
