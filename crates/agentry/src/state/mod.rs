//! Immutable execution state.
//!
//! [`ExecutionState`] is the snapshot passed between pipeline phases. Every
//! transformation takes `&self` and returns a new value, so a snapshot a
//! caller holds on to never changes underneath it.
//!
//! ```text
//!   messages ──────────────┐
//!                          ├──▶ inference_messages()  (what the next call sees)
//!   buffer (tool traces) ──┘
//!
//!   steps:  [Step, Step, ...]  append-only history
//! ```
//!
//! The execution buffer holds tool-call announcements and results while a
//! tool cycle is open. They are visible to the next inference call but stay
//! out of `messages` until a final answer drains the buffer, either folding
//! the traces into the conversation or discarding them.

mod step;
mod tool_execution;

pub use step::{InferenceInfo, Step, StepFailure, StepType};
pub use tool_execution::{ToolExecution, ToolOutcome};

pub(crate) use tool_execution::value_text;

use std::collections::HashMap;
use std::time::Duration;

use agentry_core::{ChatMessage, ChatRole, ToolCall, Usage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorKind;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// The loop may take further steps.
    #[default]
    Running,
    /// The run ended normally.
    Completed,
    /// The run ended because of an unrecovered failure.
    Failed,
}

impl ExecutionStatus {
    /// Whether no further steps will be taken.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TerminationReason {
    /// The model produced a final answer.
    FinalResponse,
    /// A continuation criterion refused another step.
    Criterion {
        /// Criterion name.
        name: String,
        /// What the criterion reported.
        detail: String,
    },
    /// A hook or phase handler set a terminal status.
    HookRequested,
    /// The run was cancelled between steps.
    Cancelled,
    /// An unrecovered failure.
    Error {
        /// Failure category.
        kind: ErrorKind,
        /// Description.
        message: String,
    },
}

/// Transient tool-call traces awaiting a final answer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionBuffer {
    messages: Vec<ChatMessage>,
}

impl ExecutionBuffer {
    /// Buffered messages in insertion order.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Number of buffered messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Tool calls announced in buffered messages.
    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.messages.iter().flat_map(|m| m.tool_calls())
    }
}

/// Run-scoped bookkeeping, reset by every `BeforeExecution`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunStats {
    /// When the current run started.
    pub started_at: Option<DateTime<Utc>>,
    /// Steps begun in the current run.
    pub step_counter: u32,
    /// Back-to-back failures of the kind in `last_failure`.
    pub consecutive_failures: u32,
    /// Failures in the current run.
    pub total_failures: u32,
    /// Kind of the failure `consecutive_failures` is counting.
    #[serde(default)]
    pub last_failure: Option<ErrorKind>,
}

/// The authoritative snapshot passed between phases.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionState {
    messages: Vec<ChatMessage>,
    steps: Vec<Step>,
    current_step: Option<Step>,
    #[serde(default)]
    metadata: HashMap<String, Value>,
    #[serde(default)]
    buffer: ExecutionBuffer,
    status: ExecutionStatus,
    #[serde(default)]
    stats: RunStats,
    termination: Option<TerminationReason>,
}

impl ExecutionState {
    /// A fresh state holding the given conversation.
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// A fresh state holding a single user message.
    pub fn from_user(text: impl Into<String>) -> Self {
        Self::new(vec![ChatMessage::user(text)])
    }

    // Queries

    /// The permanent conversation.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Completed steps, oldest first.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Number of completed steps.
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// The most recent step of the current run.
    pub fn current_step(&self) -> Option<&Step> {
        self.current_step.as_ref()
    }

    /// All metadata.
    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    /// A single metadata value.
    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// The execution buffer.
    pub fn buffer(&self) -> &ExecutionBuffer {
        &self.buffer
    }

    /// Current status.
    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    /// Whether no further steps will be taken.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Run-scoped bookkeeping.
    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    /// Why the run stopped, once it has.
    pub fn termination(&self) -> Option<&TerminationReason> {
        self.termination.as_ref()
    }

    /// Conversation followed by buffered tool traces.
    pub fn inference_messages(&self) -> Vec<ChatMessage> {
        let mut out = Vec::with_capacity(self.messages.len() + self.buffer.len());
        out.extend_from_slice(&self.messages);
        out.extend_from_slice(&self.buffer.messages);
        out
    }

    /// Tokens consumed across every recorded step.
    pub fn total_usage(&self) -> Usage {
        self.steps.iter().filter_map(|s| s.inference.as_ref()).map(|i| &i.usage).sum()
    }

    /// Steps begun in the current run. All steps before any run started.
    pub fn run_steps(&self) -> impl Iterator<Item = &Step> {
        let since = self.stats.started_at;
        self.steps
            .iter()
            .filter(move |s| since.is_none_or(|t| s.started_at >= t))
    }

    /// Tokens consumed by the steps of the current run.
    pub fn run_usage(&self) -> Usage {
        self.run_steps().filter_map(|s| s.inference.as_ref()).map(|i| &i.usage).sum()
    }

    /// Wall-clock time since the current run started.
    pub fn elapsed(&self) -> Option<Duration> {
        let started = self.stats.started_at?;
        (Utc::now() - started).to_std().ok()
    }

    /// Text of the last assistant message in the conversation.
    pub fn final_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::Assistant)
            .and_then(ChatMessage::text)
    }

    // Transformations

    /// Appends a conversation message.
    #[must_use]
    pub fn with_message(&self, message: ChatMessage) -> Self {
        let mut next = self.clone();
        next.messages.push(message);
        next
    }

    /// Inserts a message at the front of the conversation.
    #[must_use]
    pub fn with_message_prepended(&self, message: ChatMessage) -> Self {
        let mut next = self.clone();
        next.messages.insert(0, message);
        next
    }

    /// Sets a metadata value, replacing any previous one.
    #[must_use]
    pub fn with_metadata(&self, key: impl Into<String>, value: Value) -> Self {
        let mut next = self.clone();
        next.metadata.insert(key.into(), value);
        next
    }

    /// Removes a metadata value.
    #[must_use]
    pub fn without_metadata(&self, key: &str) -> Self {
        let mut next = self.clone();
        next.metadata.remove(key);
        next
    }

    /// Records a completed step in history and as the current step.
    #[must_use]
    pub fn with_step(&self, step: Step) -> Self {
        let mut next = self.clone();
        next.steps.push(step.clone());
        next.current_step = Some(step);
        next
    }

    /// Appends messages to the execution buffer.
    #[must_use]
    pub fn with_buffered(&self, messages: impl IntoIterator<Item = ChatMessage>) -> Self {
        let mut next = self.clone();
        next.buffer.messages.extend(messages);
        next
    }

    /// Discards the execution buffer.
    #[must_use]
    pub fn with_buffer_cleared(&self) -> Self {
        let mut next = self.clone();
        next.buffer.messages.clear();
        next
    }

    /// Moves the execution buffer into the conversation.
    #[must_use]
    pub fn with_buffer_folded(&self) -> Self {
        let mut next = self.clone();
        let buffered = std::mem::take(&mut next.buffer.messages);
        next.messages.extend(buffered);
        next
    }

    /// Records a terminal step: drains the buffer once (folded when
    /// `keep_traces`, otherwise discarded) and appends the step's outputs to
    /// the conversation.
    #[must_use]
    pub fn with_final_step(&self, step: Step, keep_traces: bool) -> Self {
        let drained = if keep_traces {
            self.with_buffer_folded()
        } else {
            self.with_buffer_cleared()
        };
        let mut next = drained.with_step(step);
        let outputs = next
            .current_step
            .as_ref()
            .map(|s| s.output_messages.clone())
            .unwrap_or_default();
        next.messages.extend(outputs);
        next
    }

    /// Sets the status.
    #[must_use]
    pub fn with_status(&self, status: ExecutionStatus) -> Self {
        let mut next = self.clone();
        next.status = status;
        next
    }

    /// Marks the run completed for `reason`.
    #[must_use]
    pub fn completed(&self, reason: TerminationReason) -> Self {
        let mut next = self.with_status(ExecutionStatus::Completed);
        next.termination = Some(reason);
        next
    }

    /// Marks the run failed for `reason`.
    #[must_use]
    pub fn failed(&self, reason: TerminationReason) -> Self {
        let mut next = self.with_status(ExecutionStatus::Failed);
        next.termination = Some(reason);
        next
    }

    /// Starts a new run: status back to `Running`, fresh stats and no
    /// current step. Conversation and history are kept.
    #[must_use]
    pub fn with_run_started(&self, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.status = ExecutionStatus::Running;
        next.termination = None;
        next.current_step = None;
        next.stats = RunStats {
            started_at: Some(now),
            ..RunStats::default()
        };
        next
    }

    /// Counts a step about to begin.
    #[must_use]
    pub fn with_step_started(&self) -> Self {
        let mut next = self.clone();
        next.stats.step_counter = next.stats.step_counter.saturating_add(1);
        next
    }

    /// Counts a failure of `kind`. A failure of a different kind than the
    /// previous one starts a new streak.
    #[must_use]
    pub fn with_failure_recorded(&self, kind: ErrorKind) -> Self {
        let mut next = self.clone();
        next.stats.consecutive_failures = if next.stats.last_failure == Some(kind) {
            next.stats.consecutive_failures.saturating_add(1)
        } else {
            1
        };
        next.stats.last_failure = Some(kind);
        next.stats.total_failures = next.stats.total_failures.saturating_add(1);
        next
    }

    /// Ends the current failure streak after a clean step.
    #[must_use]
    pub fn with_failures_reset(&self) -> Self {
        let mut next = self.clone();
        next.stats.consecutive_failures = 0;
        next.stats.last_failure = None;
        next
    }

    /// Converts to a plain JSON record.
    pub fn to_record(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Rebuilds a state from [`to_record`](Self::to_record) output.
    pub fn from_record(record: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentry_core::StopReason;
    use serde_json::json;

    fn tool_step() -> Step {
        let now = Utc::now();
        let call = ToolCall::new("tc_1", "search", json!({"q": "x"}));
        let exec = ToolExecution::success(call.clone(), json!("result"), now, now);
        Step::tool_execution(
            vec![ChatMessage::user("Use the tool")],
            vec![
                ChatMessage::tool_announcement(None, call),
                ChatMessage::tool_result("tc_1", "result"),
            ],
            vec![exec],
            Some(InferenceInfo {
                usage: Usage::new(10, 5),
                stop_reason: StopReason::ToolUse,
                model: "m".into(),
            }),
            now,
        )
    }

    fn final_step(text: &str) -> Step {
        Step::final_response(
            vec![],
            vec![ChatMessage::assistant(text)],
            Some(InferenceInfo {
                usage: Usage::new(20, 2),
                stop_reason: StopReason::EndTurn,
                model: "m".into(),
            }),
            Utc::now(),
        )
    }

    #[test]
    fn test_transformations_leave_original_untouched() {
        let original = ExecutionState::from_user("hi");
        let before = original.clone();

        let a = original.with_message(ChatMessage::assistant("hello"));
        let b = original.with_metadata("x", json!(1));
        let c = original.with_step(tool_step());
        let d = original.with_status(ExecutionStatus::Failed);
        let e = original.with_buffered([ChatMessage::tool_result("1", "r")]);

        assert_eq!(original, before);
        for changed in [a, b, c, d, e] {
            assert_ne!(changed, original);
        }
    }

    #[test]
    fn test_buffer_visible_to_inference_not_messages() {
        let state =
            ExecutionState::from_user("Use the tool").with_buffered(tool_step().output_messages);
        assert_eq!(state.messages().len(), 1);
        assert_eq!(state.buffer().len(), 2);
        assert_eq!(state.inference_messages().len(), 3);
        assert_eq!(state.buffer().tool_calls().count(), 1);
    }

    #[test]
    fn test_final_step_discards_traces() {
        let state = ExecutionState::from_user("Use the tool")
            .with_buffered(tool_step().output_messages)
            .with_final_step(final_step("Done."), false);
        assert!(state.buffer().is_empty());
        assert_eq!(state.messages().len(), 2);
        assert!(!state.messages().iter().any(ChatMessage::is_tool_result));
        assert_eq!(state.final_text().as_deref(), Some("Done."));
    }

    #[test]
    fn test_final_step_folds_traces() {
        let state = ExecutionState::from_user("Use the tool")
            .with_buffered(tool_step().output_messages)
            .with_final_step(final_step("Done."), true);
        assert!(state.buffer().is_empty());
        assert_eq!(state.messages().len(), 4);
        assert!(state.messages()[2].is_tool_result());
    }

    #[test]
    fn test_total_usage_sums_steps() {
        let state = ExecutionState::default()
            .with_step(tool_step())
            .with_step(final_step("x"));
        assert_eq!(state.total_usage(), Usage::new(30, 7));
    }

    #[test]
    fn test_run_started_resets_run_scope() {
        let state = ExecutionState::from_user("hi")
            .with_step(final_step("x"))
            .with_step_started()
            .with_failure_recorded(ErrorKind::Model)
            .completed(TerminationReason::FinalResponse);
        let next = state.with_run_started(Utc::now());
        assert_eq!(next.status(), ExecutionStatus::Running);
        assert!(next.termination().is_none());
        assert!(next.current_step().is_none());
        assert_eq!(next.stats().step_counter, 0);
        assert_eq!(next.stats().total_failures, 0);
        assert_eq!(next.step_count(), 1);
        assert!(next.elapsed().is_some());
    }

    #[test]
    fn test_failure_counters() {
        let state = ExecutionState::default()
            .with_failure_recorded(ErrorKind::Timeout)
            .with_failure_recorded(ErrorKind::Timeout);
        assert_eq!(state.stats().consecutive_failures, 2);
        let state = state.with_failures_reset();
        assert_eq!(state.stats().consecutive_failures, 0);
        assert_eq!(state.stats().last_failure, None);
        assert_eq!(state.stats().total_failures, 2);
    }

    #[test]
    fn test_new_failure_kind_starts_new_streak() {
        let state = ExecutionState::default()
            .with_failure_recorded(ErrorKind::Tool)
            .with_failure_recorded(ErrorKind::Tool)
            .with_failure_recorded(ErrorKind::RateLimit);
        assert_eq!(state.stats().consecutive_failures, 1);
        assert_eq!(state.stats().last_failure, Some(ErrorKind::RateLimit));
        assert_eq!(state.stats().total_failures, 3);
    }

    #[test]
    fn test_record_round_trip() {
        let state = ExecutionState::from_user("Use the tool")
            .with_metadata("iteration", json!(3))
            .with_step(tool_step())
            .with_buffered(tool_step().output_messages)
            .with_run_started(Utc::now())
            .with_step_started()
            .failed(TerminationReason::Error {
                kind: ErrorKind::Model,
                message: "boom".into(),
            });

        let record = state.to_record().unwrap();
        assert_eq!(record["status"], "failed");
        assert_eq!(record["termination"]["reason"], "error");
        let back = ExecutionState::from_record(record).unwrap();
        assert_eq!(back, state);
    }
}
