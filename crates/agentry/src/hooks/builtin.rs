//! Ready-made hooks.

use std::fmt;

use agentry_core::{ChatMessage, ChatRole};
use serde_json::{Value, json};

use super::{Hook, HookContext, HookTrigger};
use crate::error::ErrorKind;
use crate::state::TerminationReason;

/// Blocks tool calls whose string arguments contain a deny-listed substring.
///
/// ```rust
/// use agentry::hooks::{HookStack, ToolCallGuard};
///
/// let hooks = HookStack::new().with(ToolCallGuard::dangerous_commands(), 100);
/// assert_eq!(hooks.names(), ["tool_call_guard"]);
/// ```
#[derive(Debug, Clone)]
pub struct ToolCallGuard {
    patterns: Vec<String>,
    reason: String,
    tools: Option<Vec<String>>,
}

impl ToolCallGuard {
    /// A guard blocking any argument containing one of `patterns`.
    pub fn new<I, S>(reason: impl Into<String>, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns.into_iter().map(Into::into).collect(),
            reason: reason.into(),
            tools: None,
        }
    }

    /// A guard against destructive shell commands.
    pub fn dangerous_commands() -> Self {
        Self::new(
            "Dangerous command blocked",
            [
                "rm -rf",
                "rm -fr",
                "mkfs",
                "dd if=",
                ":(){ :|:& };:",
                "> /dev/sda",
                "chmod -R 777 /",
                "shutdown",
            ],
        )
    }

    /// Restricts the guard to the named tools.
    #[must_use]
    pub fn for_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = Some(tools.into_iter().map(Into::into).collect());
        self
    }

    fn matching_pattern(&self, args: &Value) -> Option<&str> {
        let mut strings = Vec::new();
        collect_strings(args, &mut strings);
        self.patterns
            .iter()
            .find(|p| strings.iter().any(|s| s.contains(p.as_str())))
            .map(String::as_str)
    }
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

impl Hook for ToolCallGuard {
    fn name(&self) -> &str {
        "tool_call_guard"
    }

    fn triggers(&self) -> &[HookTrigger] {
        &[HookTrigger::BeforeToolUse]
    }

    fn handle(&self, mut ctx: HookContext) -> HookContext {
        let Some(pending) = ctx.tool_call.as_ref() else {
            return ctx;
        };
        if let Some(tools) = &self.tools {
            if !tools.iter().any(|t| *t == pending.call.name) {
                return ctx;
            }
        }
        if let Some(pattern) = self.matching_pattern(&pending.call.arguments) {
            let reason = format!("{}: matched '{pattern}'", self.reason);
            ctx.block(reason);
        }
        ctx
    }
}

/// Prepends a system message at `BeforeExecution` unless the conversation
/// already starts with one.
#[derive(Debug, Clone)]
pub struct SystemPromptHook {
    prompt: String,
}

impl SystemPromptHook {
    /// A hook injecting `prompt`.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
        }
    }
}

impl Hook for SystemPromptHook {
    fn name(&self) -> &str {
        "system_prompt"
    }

    fn triggers(&self) -> &[HookTrigger] {
        &[HookTrigger::BeforeExecution]
    }

    fn handle(&self, ctx: HookContext) -> HookContext {
        let has_system = ctx
            .state
            .messages()
            .first()
            .is_some_and(|m| m.role == ChatRole::System);
        if has_system {
            return ctx;
        }
        let state = ctx
            .state
            .with_message_prepended(ChatMessage::system(self.prompt.clone()));
        ctx.with_state(state)
    }
}

/// Increments a metadata counter at every `BeforeStep`.
#[derive(Debug, Clone)]
pub struct StepCounterHook {
    key: String,
}

impl StepCounterHook {
    /// A counter stored under `key`.
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl Default for StepCounterHook {
    fn default() -> Self {
        Self::new("iterations")
    }
}

impl Hook for StepCounterHook {
    fn name(&self) -> &str {
        "step_counter"
    }

    fn triggers(&self) -> &[HookTrigger] {
        &[HookTrigger::BeforeStep]
    }

    fn handle(&self, ctx: HookContext) -> HookContext {
        let current = ctx
            .state
            .metadata_value(&self.key)
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let state = ctx.state.with_metadata(self.key.clone(), json!(current + 1));
        ctx.with_state(state)
    }
}

/// Fails the run at `AfterStep` once this run has accumulated
/// `max_failures` failed tool executions.
#[derive(Debug, Clone)]
pub struct ToolFailureLimit {
    max_failures: usize,
}

impl ToolFailureLimit {
    /// A limit of `max_failures`.
    pub fn new(max_failures: usize) -> Self {
        Self { max_failures }
    }
}

impl Hook for ToolFailureLimit {
    fn name(&self) -> &str {
        "tool_failure_limit"
    }

    fn triggers(&self) -> &[HookTrigger] {
        &[HookTrigger::AfterStep]
    }

    fn handle(&self, ctx: HookContext) -> HookContext {
        let failures: usize = ctx
            .state
            .run_steps()
            .map(crate::state::Step::failed_tool_count)
            .sum();
        if failures < self.max_failures {
            return ctx;
        }
        tracing::warn!(failures, limit = self.max_failures, "tool failure limit reached");
        let state = ctx.state.failed(TerminationReason::Error {
            kind: ErrorKind::Tool,
            message: format!("{failures} tool executions failed (limit {})", self.max_failures),
        });
        ctx.with_state(state)
    }
}

/// Logs every trigger at `debug` level. Observational only.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingHook;

impl Hook for TracingHook {
    fn name(&self) -> &str {
        "tracing"
    }

    fn triggers(&self) -> &[HookTrigger] {
        &HookTrigger::ALL
    }

    fn handle(&self, ctx: HookContext) -> HookContext {
        tracing::debug!(
            trigger = %ctx.trigger,
            steps = ctx.state.step_count(),
            status = ?ctx.state.status(),
            tool = ctx.tool_call.as_ref().map(|p| p.call.name.as_str()),
            "hook trigger"
        );
        ctx
    }
}

/// Adapts a closure into a [`Hook`].
///
/// ```rust
/// use agentry::hooks::{FnHook, HookTrigger};
///
/// let veto_shell = FnHook::new("no_shell", [HookTrigger::BeforeToolUse], |mut ctx| {
///     if ctx.tool_call.as_ref().is_some_and(|p| p.call.name == "shell") {
///         ctx.block("shell is disabled");
///     }
///     ctx
/// });
/// ```
pub struct FnHook<F> {
    name: String,
    triggers: Vec<HookTrigger>,
    f: F,
}

impl<F> FnHook<F>
where
    F: Fn(HookContext) -> HookContext + Send + Sync,
{
    /// Wraps `f`, firing on `triggers`.
    pub fn new(
        name: impl Into<String>,
        triggers: impl IntoIterator<Item = HookTrigger>,
        f: F,
    ) -> Self {
        Self {
            name: name.into(),
            triggers: triggers.into_iter().collect(),
            f,
        }
    }
}

impl<F> fmt::Debug for FnHook<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHook")
            .field("name", &self.name)
            .field("triggers", &self.triggers)
            .finish_non_exhaustive()
    }
}

impl<F> Hook for FnHook<F>
where
    F: Fn(HookContext) -> HookContext + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn triggers(&self) -> &[HookTrigger] {
        &self.triggers
    }

    fn handle(&self, ctx: HookContext) -> HookContext {
        (self.f)(ctx)
    }
}
