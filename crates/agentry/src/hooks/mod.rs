//! Lifecycle hooks.
//!
//! A [`Hook`] is an interceptor object invoked at the [`HookTrigger`]s it
//! declares. Hooks are composed into a [`HookStack`] by priority; the stack
//! threads one [`HookContext`] through every matching hook and hands the
//! result back to the pipeline or tool executor.
//!
//! # Architecture
//!
//! ```text
//!   HookStack::new()
//!       .with(ToolCallGuard::dangerous_commands(), 100)   // runs first
//!       .with(StepCounterHook::default(), 50)
//!       .with(TracingHook, 0)                             // runs last
//!
//!   dispatch(trigger, ctx)
//!       ctx ─▶ hook(100) ─▶ hook(50) ─▶ hook(0) ─▶ ctx'
//! ```
//!
//! What a hook can do depends on the trigger:
//!
//! | Trigger | Honored edits |
//! |---------|---------------|
//! | `BeforeExecution`, `BeforeStep`, `AfterStep`, `AfterExecution`, `OnError` | Replace the state, including setting a terminal status |
//! | `BeforeToolUse` | Block the pending call or rewrite its arguments |
//! | `AfterToolUse` | Replace the finished [`ToolExecution`] |
//!
//! State edits made at the tool-level triggers are discarded.

mod builtin;
mod stack;

pub use builtin::{
    FnHook, StepCounterHook, SystemPromptHook, ToolCallGuard, ToolFailureLimit, TracingHook,
};
pub use stack::HookStack;

use std::fmt;

use agentry_core::ToolCall;
use serde::{Deserialize, Serialize};

use crate::state::{ExecutionState, StepFailure, ToolExecution};

/// Lifecycle points a hook can fire on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookTrigger {
    /// Once, before the first step.
    BeforeExecution,
    /// Before every step.
    BeforeStep,
    /// Before each tool call is invoked.
    BeforeToolUse,
    /// After each tool call finishes.
    AfterToolUse,
    /// After every successful step.
    AfterStep,
    /// Once, after the loop exits.
    AfterExecution,
    /// After a runtime error was recorded.
    OnError,
}

impl HookTrigger {
    /// Every trigger.
    pub const ALL: [Self; 7] = [
        Self::BeforeExecution,
        Self::BeforeStep,
        Self::BeforeToolUse,
        Self::AfterToolUse,
        Self::AfterStep,
        Self::AfterExecution,
        Self::OnError,
    ];
}

impl fmt::Display for HookTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BeforeExecution => "before_execution",
            Self::BeforeStep => "before_step",
            Self::BeforeToolUse => "before_tool_use",
            Self::AfterToolUse => "after_tool_use",
            Self::AfterStep => "after_step",
            Self::AfterExecution => "after_execution",
            Self::OnError => "on_error",
        };
        f.write_str(name)
    }
}

/// A tool call awaiting execution.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingToolCall {
    /// The call; hooks may rewrite its arguments.
    pub call: ToolCall,
    /// Block reason, if a hook vetoed the call.
    pub blocked: Option<String>,
}

impl PendingToolCall {
    /// An unblocked pending call.
    pub fn new(call: ToolCall) -> Self {
        Self {
            call,
            blocked: None,
        }
    }

    /// Vetoes the call. The first reason wins.
    pub fn block(&mut self, reason: impl Into<String>) {
        if self.blocked.is_none() {
            self.blocked = Some(reason.into());
        }
    }

    /// Whether a hook vetoed the call.
    pub fn is_blocked(&self) -> bool {
        self.blocked.is_some()
    }
}

/// What a hook receives and returns.
#[derive(Debug, Clone)]
pub struct HookContext {
    /// Trigger being dispatched.
    pub trigger: HookTrigger,
    /// Current state.
    pub state: ExecutionState,
    /// Set for `BeforeToolUse`.
    pub tool_call: Option<PendingToolCall>,
    /// Set for `AfterToolUse`.
    pub tool_execution: Option<ToolExecution>,
    /// Set for `OnError`.
    pub failure: Option<StepFailure>,
}

impl HookContext {
    /// A context carrying only state.
    pub fn new(trigger: HookTrigger, state: ExecutionState) -> Self {
        Self {
            trigger,
            state,
            tool_call: None,
            tool_execution: None,
            failure: None,
        }
    }

    /// A `BeforeToolUse` context.
    pub fn for_tool_call(state: ExecutionState, call: ToolCall) -> Self {
        Self {
            tool_call: Some(PendingToolCall::new(call)),
            ..Self::new(HookTrigger::BeforeToolUse, state)
        }
    }

    /// An `AfterToolUse` context.
    pub fn for_tool_execution(state: ExecutionState, execution: ToolExecution) -> Self {
        Self {
            tool_execution: Some(execution),
            ..Self::new(HookTrigger::AfterToolUse, state)
        }
    }

    /// An `OnError` context.
    pub fn for_failure(state: ExecutionState, failure: StepFailure) -> Self {
        Self {
            failure: Some(failure),
            ..Self::new(HookTrigger::OnError, state)
        }
    }

    /// Blocks the pending tool call, if there is one.
    pub fn block(&mut self, reason: impl Into<String>) {
        if let Some(pending) = self.tool_call.as_mut() {
            pending.block(reason);
        }
    }

    /// Replaces the state.
    #[must_use]
    pub fn with_state(mut self, state: ExecutionState) -> Self {
        self.state = state;
        self
    }
}

/// An interceptor invoked at lifecycle triggers.
///
/// Hooks hold their configuration as fields and transform the context they
/// are given. They must not rely on effects outside the returned context
/// for control flow; logging and similar observation are fine.
pub trait Hook: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Triggers this hook fires on.
    fn triggers(&self) -> &[HookTrigger];

    /// Transforms the context.
    fn handle(&self, ctx: HookContext) -> HookContext;
}
