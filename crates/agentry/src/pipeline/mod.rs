//! The phase-based execution loop.
//!
//! ```text
//!   BeforeExecution
//!        │
//!        ▼
//!   ┌─▶ ShouldContinue ──stop──▶ AfterExecution
//!   │        │ continue
//!   │        ▼
//!   │    BeforeStep
//!   │        │
//!   │        ▼
//!   │    ExecuteStep ──runtime error──▶ OnError ─┐
//!   │        │                                   │
//!   │        ▼                                   │
//!   │    AfterStep                               │
//!   │        │                                   │
//!   └────────┴───────────────────────────────────┘
//! ```
//!
//! Each phase runs its [`PhaseHandler`]s in registration order, then the
//! hooks for the phase's [`HookTrigger`] in priority order. A handler or
//! hook may end the run by setting a terminal status; the loop checks for
//! it after every dispatch.
//!
//! Runtime failures never escape: they become a [`StepType::Error`] step
//! and the [`ErrorPolicy`] decides whether the run goes on. Programming
//! errors ([`AgentError::is_programming_error`]) are returned as `Err`.
//!
//! [`StepType::Error`]: crate::state::StepType::Error

mod continuation;
mod error_policy;

pub use continuation::{
    ContinuationContext, ContinuationCriteria, ContinuationCriterion, CustomCriterion,
    ErrorPresenceCheck, ExecutionTimeLimit, FinishReasonCheck, StepsLimit, TokenUsageLimit,
    ToolCallPresenceCheck,
};
pub use error_policy::{ErrorDecision, ErrorPolicy};

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::driver::Driver;
use crate::error::{AgentError, ErrorKind};
use crate::events::{AgentEvent, EventEmitter};
use crate::hooks::{HookContext, HookStack, HookTrigger};
use crate::state::{ExecutionState, ExecutionStatus, Step, StepFailure, TerminationReason};
use crate::tool::{ToolExecutor, ToolRegistry};

/// Pipeline phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Once per run, before the loop.
    BeforeExecution,
    /// Top of every iteration. Extended through continuation criteria.
    ShouldContinue,
    /// Before the driver is called.
    BeforeStep,
    /// After the driver's step has been recorded.
    ExecuteStep,
    /// After a successful step.
    AfterStep,
    /// Once per run, after the loop.
    AfterExecution,
    /// After a runtime failure was recorded.
    OnError,
}

impl Phase {
    /// The hook trigger dispatched at the end of this phase.
    pub fn trigger(self) -> Option<HookTrigger> {
        match self {
            Self::BeforeExecution => Some(HookTrigger::BeforeExecution),
            Self::BeforeStep => Some(HookTrigger::BeforeStep),
            Self::AfterStep => Some(HookTrigger::AfterStep),
            Self::AfterExecution => Some(HookTrigger::AfterExecution),
            Self::OnError => Some(HookTrigger::OnError),
            Self::ShouldContinue | Self::ExecuteStep => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BeforeExecution => "before_execution",
            Self::ShouldContinue => "should_continue",
            Self::BeforeStep => "before_step",
            Self::ExecuteStep => "execute_step",
            Self::AfterStep => "after_step",
            Self::AfterExecution => "after_execution",
            Self::OnError => "on_error",
        };
        f.write_str(name)
    }
}

/// Async code run at a pipeline phase.
///
/// Returning `Err` with a runtime error sends the run to `OnError` with the
/// state as it was before this handler ran.
pub trait PhaseHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Transforms the state.
    fn handle<'a>(
        &'a self,
        phase: Phase,
        state: ExecutionState,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutionState, AgentError>> + Send + 'a>>;
}

/// Adapts a synchronous closure into a [`PhaseHandler`].
pub struct FnPhaseHandler<F> {
    name: String,
    f: F,
}

impl<F> FnPhaseHandler<F>
where
    F: Fn(Phase, ExecutionState) -> Result<ExecutionState, AgentError> + Send + Sync,
{
    /// Wraps `f` under `name`.
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> fmt::Debug for FnPhaseHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnPhaseHandler")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<F> PhaseHandler for FnPhaseHandler<F>
where
    F: Fn(Phase, ExecutionState) -> Result<ExecutionState, AgentError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn handle<'a>(
        &'a self,
        phase: Phase,
        state: ExecutionState,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutionState, AgentError>> + Send + 'a>> {
        let result = (self.f)(phase, state);
        Box::pin(async move { result })
    }
}

/// Outcome of [`ExecutionPipeline::check_continuation`].
#[derive(Debug, Clone, PartialEq)]
pub enum Continuation {
    /// Take another step.
    Continue(ExecutionState),
    /// Leave the loop. The state carries a terminal status.
    Stop(ExecutionState),
}

/// A phase that failed partway, with the state from before the failing
/// handler.
struct Interrupted {
    state: ExecutionState,
    error: AgentError,
}

/// The execution loop.
///
/// Built once per agent and read-only afterwards. The individual phases
/// are public so a caller can drive the loop step by step; [`run`](Self::run)
/// strings them together.
#[derive(Clone)]
pub struct ExecutionPipeline {
    driver: Arc<dyn Driver>,
    tools: ToolRegistry,
    hooks: HookStack,
    handlers: Vec<(Phase, Arc<dyn PhaseHandler>)>,
    criteria: ContinuationCriteria,
    error_policy: ErrorPolicy,
    events: EventEmitter,
    cancel: CancellationToken,
    keep_tool_traces: bool,
    parallel_tools: bool,
}

impl fmt::Debug for ExecutionPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers: Vec<(Phase, &str)> =
            self.handlers.iter().map(|(p, h)| (*p, h.name())).collect();
        f.debug_struct("ExecutionPipeline")
            .field("driver", &self.driver.name())
            .field("tools", &self.tools.names())
            .field("hooks", &self.hooks)
            .field("handlers", &handlers)
            .field("criteria", &self.criteria)
            .field("error_policy", &self.error_policy)
            .field("keep_tool_traces", &self.keep_tool_traces)
            .field("parallel_tools", &self.parallel_tools)
            .finish_non_exhaustive()
    }
}

impl ExecutionPipeline {
    /// A pipeline around `driver` and `tools`.
    ///
    /// Until [`with_criteria`](Self::with_criteria) is called the only
    /// criterion is [`ToolCallPresenceCheck`], so the loop runs until the
    /// model answers without tools or a hook ends it.
    pub fn new(driver: Arc<dyn Driver>, tools: ToolRegistry) -> Self {
        Self {
            driver,
            tools,
            hooks: HookStack::new(),
            handlers: Vec::new(),
            criteria: ContinuationCriteria::new().with(ToolCallPresenceCheck),
            error_policy: ErrorPolicy::default(),
            events: EventEmitter::new(),
            cancel: CancellationToken::new(),
            keep_tool_traces: false,
            parallel_tools: false,
        }
    }

    /// Sets the hook stack.
    #[must_use]
    pub fn with_hooks(mut self, hooks: HookStack) -> Self {
        self.hooks = hooks;
        self
    }

    /// Appends a handler for `phase`.
    ///
    /// `ShouldContinue` takes no handlers; one registered there is dropped.
    /// Use a [`ContinuationCriterion`] instead.
    #[must_use]
    pub fn with_handler(mut self, phase: Phase, handler: Arc<dyn PhaseHandler>) -> Self {
        if phase == Phase::ShouldContinue {
            warn!(handler = handler.name(), "ignoring ShouldContinue handler");
            return self;
        }
        self.handlers.push((phase, handler));
        self
    }

    /// Replaces the continuation criteria.
    #[must_use]
    pub fn with_criteria(mut self, criteria: ContinuationCriteria) -> Self {
        self.criteria = criteria;
        self
    }

    /// Sets the error policy.
    #[must_use]
    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// Sets the event emitter.
    #[must_use]
    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    /// Sets the token checked at the top of every iteration. Once
    /// cancelled it stops this and every later run.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Folds tool traces into the conversation instead of discarding them.
    #[must_use]
    pub fn with_keep_tool_traces(mut self, keep: bool) -> Self {
        self.keep_tool_traces = keep;
        self
    }

    /// Runs a step's approved tool calls concurrently.
    #[must_use]
    pub fn with_parallel_tools(mut self, parallel: bool) -> Self {
        self.parallel_tools = parallel;
        self
    }

    /// The cancellation token.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The registered tools.
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// The error policy.
    pub fn error_policy(&self) -> &ErrorPolicy {
        &self.error_policy
    }

    fn executor(&self) -> ToolExecutor {
        ToolExecutor::new(self.hooks.clone(), self.events.clone())
            .with_parallel(self.parallel_tools)
    }

    /// Runs the full lifecycle and returns the final state.
    ///
    /// Only programming errors are returned as `Err`. Every other failure
    /// is recorded in the state.
    pub async fn run(&self, state: ExecutionState) -> Result<ExecutionState, AgentError> {
        self.run_cancellable(state, &self.cancel).await
    }

    /// [`run`](Self::run), checking `cancel` between steps instead of the
    /// pipeline's own token.
    #[instrument(skip_all, fields(driver = self.driver.name(), tools = self.tools.len()))]
    pub(crate) async fn run_cancellable(
        &self,
        state: ExecutionState,
        cancel: &CancellationToken,
    ) -> Result<ExecutionState, AgentError> {
        let mut state = self.before_execution(state).await?;
        loop {
            match self.continuation(state, cancel) {
                Continuation::Continue(next) => state = self.run_step(next).await?,
                Continuation::Stop(done) => {
                    state = done;
                    break;
                }
            }
        }
        self.after_execution(state).await
    }

    /// `BeforeExecution`: starts run-scoped bookkeeping, then runs the
    /// phase's handlers and hooks.
    pub async fn before_execution(
        &self,
        state: ExecutionState,
    ) -> Result<ExecutionState, AgentError> {
        let state = state.with_run_started(Utc::now());
        let state = match self.run_phase(Phase::BeforeExecution, state).await {
            Ok(state) => state,
            Err(interrupted) => return self.recover(interrupted).await,
        };
        debug!(messages = state.messages().len(), "execution started");
        self.events.emit(AgentEvent::ExecutionStarted {
            message_count: state.messages().len(),
        });
        Ok(state)
    }

    /// `ShouldContinue`: cancellation, then status, then criteria.
    ///
    /// Stopping for cancellation or a criterion marks the run completed.
    pub fn check_continuation(&self, state: ExecutionState) -> Continuation {
        self.continuation(state, &self.cancel)
    }

    pub(crate) fn continuation(
        &self,
        state: ExecutionState,
        cancel: &CancellationToken,
    ) -> Continuation {
        if state.is_terminal() {
            return Continuation::Stop(state);
        }
        if cancel.is_cancelled() {
            debug!("execution cancelled");
            return Continuation::Stop(state.completed(TerminationReason::Cancelled));
        }
        let stop = self.criteria.first_stop(&ContinuationContext::new(&state));
        let Some((name, detail)) = stop else {
            return Continuation::Continue(state);
        };
        let reason = if state.current_step().is_some_and(Step::is_final) {
            TerminationReason::FinalResponse
        } else {
            debug!(criterion = %name, %detail, "continuation criterion stopped the run");
            TerminationReason::Criterion { name, detail }
        };
        Continuation::Stop(state.completed(reason))
    }

    /// One iteration: `BeforeStep`, `ExecuteStep`, then `AfterStep`, or
    /// `OnError` if the step failed.
    #[instrument(skip_all, fields(step = state.stats().step_counter + 1))]
    pub async fn run_step(&self, state: ExecutionState) -> Result<ExecutionState, AgentError> {
        let state = state.with_step_started();
        let step_no = state.stats().step_counter;
        self.events.emit(AgentEvent::StepStarted { step: step_no });

        let state = match self.run_phase(Phase::BeforeStep, state).await {
            Ok(state) => state,
            Err(interrupted) => return self.recover(interrupted).await,
        };
        if state.is_terminal() {
            debug!(status = ?state.status(), "run ended by BeforeStep");
            return Ok(state);
        }

        let started_at = Utc::now();
        let step = match self
            .driver
            .use_tools(&state, &self.tools, &self.executor())
            .await
        {
            Ok(step) => step,
            Err(err) if err.is_programming_error() => return Err(err),
            Err(err) => {
                let step = Step::error(
                    err.kind(),
                    err.to_string(),
                    state.inference_messages(),
                    started_at,
                );
                return self.on_error(state, step).await;
            }
        };
        if step.is_error() {
            return self.on_error(state, step).await;
        }

        let step_type = step.step_type;
        let failed_tools = step.failed_tool_count();
        let state = if step.is_final() {
            state.with_final_step(step, self.keep_tool_traces)
        } else {
            state
                .with_buffered(step.output_messages.iter().cloned())
                .with_step(step)
        };

        let state = match self.run_phase(Phase::ExecuteStep, state).await {
            Ok(state) => state,
            Err(interrupted) => return self.recover(interrupted).await,
        };
        let state = self.account_tool_failures(state, failed_tools);

        let state = match self.run_phase(Phase::AfterStep, state).await {
            Ok(state) => state,
            Err(interrupted) => return self.recover(interrupted).await,
        };
        debug!(?step_type, status = ?state.status(), "step completed");
        self.events.emit(AgentEvent::StepCompleted {
            step: step_no,
            step_type,
        });
        Ok(state)
    }

    /// `AfterExecution`: runs handlers and hooks, drains the execution
    /// buffer and settles a still-running state as completed.
    pub async fn after_execution(
        &self,
        state: ExecutionState,
    ) -> Result<ExecutionState, AgentError> {
        let state = match self.run_phase(Phase::AfterExecution, state).await {
            Ok(state) => state,
            Err(Interrupted { error, .. }) if error.is_programming_error() => return Err(error),
            Err(Interrupted { state, error }) => {
                warn!(%error, "AfterExecution handler failed");
                state.failed(TerminationReason::Error {
                    kind: error.kind(),
                    message: error.to_string(),
                })
            }
        };
        let state = if self.keep_tool_traces {
            state.with_buffer_folded()
        } else {
            state.with_buffer_cleared()
        };
        let state = match state.status() {
            ExecutionStatus::Running if state.current_step().is_some_and(Step::is_final) => {
                state.completed(TerminationReason::FinalResponse)
            }
            ExecutionStatus::Running => state.with_status(ExecutionStatus::Completed),
            _ => state,
        };
        debug!(status = ?state.status(), steps = state.step_count(), "execution finished");
        self.events.emit(AgentEvent::ExecutionFinished {
            status: state.status(),
            steps: state.step_count(),
            termination: state.termination().cloned(),
        });
        Ok(state)
    }

    /// Applies the tool-error policy to a step with failed executions.
    /// Ignored tool failures are counted but end any failure streak.
    fn account_tool_failures(&self, state: ExecutionState, failed: usize) -> ExecutionState {
        if failed == 0 {
            return state.with_failures_reset();
        }
        let state = state.with_failure_recorded(ErrorKind::Tool);
        if self.error_policy.decision(ErrorKind::Tool) == ErrorDecision::Ignore {
            return state.with_failures_reset();
        }
        let consecutive = state.stats().consecutive_failures;
        if self.error_policy.should_continue(ErrorKind::Tool, consecutive) {
            return state;
        }
        warn!(failed, consecutive, "tool failures end the run");
        state.failed(TerminationReason::Error {
            kind: ErrorKind::Tool,
            message: format!("{failed} tool execution(s) failed"),
        })
    }

    /// `OnError`: records the failed step, applies the error policy, then
    /// runs the phase's handlers and hooks with the failure in context.
    async fn on_error(
        &self,
        state: ExecutionState,
        step: Step,
    ) -> Result<ExecutionState, AgentError> {
        let failure = step.failure.clone().unwrap_or_else(|| StepFailure {
            kind: ErrorKind::Unknown,
            message: "step failed".into(),
        });
        warn!(kind = %failure.kind, message = %failure.message, "step failed");
        self.events.emit(AgentEvent::ErrorOccurred {
            kind: failure.kind,
            message: failure.message.clone(),
        });

        let state = state
            .with_buffered(step.output_messages.iter().cloned())
            .with_step(step)
            .with_failure_recorded(failure.kind);
        let consecutive = state.stats().consecutive_failures;
        let state = if self.error_policy.should_continue(failure.kind, consecutive) {
            debug!(consecutive, "continuing after failure");
            state
        } else {
            state.failed(TerminationReason::Error {
                kind: failure.kind,
                message: failure.message.clone(),
            })
        };

        let state = match self.run_handlers(Phase::OnError, state).await {
            Ok(state) => state,
            Err(Interrupted { error, .. }) if error.is_programming_error() => return Err(error),
            Err(Interrupted { state, error }) => {
                warn!(%error, "OnError handler failed");
                state
            }
        };
        if !self.hooks.handles(HookTrigger::OnError) {
            return Ok(state);
        }
        let ctx = HookContext::for_failure(state, failure);
        Ok(settle(self.hooks.dispatch(HookTrigger::OnError, ctx).state))
    }

    /// Routes a failed phase to `OnError`, or propagates a programming error.
    async fn recover(&self, interrupted: Interrupted) -> Result<ExecutionState, AgentError> {
        let Interrupted { state, error } = interrupted;
        if error.is_programming_error() {
            return Err(error);
        }
        let step = Step::error(error.kind(), error.to_string(), Vec::new(), Utc::now());
        self.on_error(state, step).await
    }

    async fn run_phase(
        &self,
        phase: Phase,
        state: ExecutionState,
    ) -> Result<ExecutionState, Interrupted> {
        let state = self.run_handlers(phase, state).await?;
        let state = match phase.trigger() {
            Some(trigger) if self.hooks.handles(trigger) => {
                self.hooks
                    .dispatch(trigger, HookContext::new(trigger, state))
                    .state
            }
            _ => state,
        };
        Ok(settle(state))
    }

    async fn run_handlers(
        &self,
        phase: Phase,
        mut state: ExecutionState,
    ) -> Result<ExecutionState, Interrupted> {
        for (registered, handler) in &self.handlers {
            if *registered != phase {
                continue;
            }
            trace!(handler = handler.name(), %phase, "running phase handler");
            match handler.handle(phase, state.clone()).await {
                Ok(next) => state = next,
                Err(error) => return Err(Interrupted { state, error }),
            }
        }
        Ok(state)
    }
}

/// Attributes a terminal status set without a reason to the hook or
/// handler that set it.
fn settle(state: ExecutionState) -> ExecutionState {
    if state.termination().is_some() {
        return state;
    }
    match state.status() {
        ExecutionStatus::Running => state,
        ExecutionStatus::Completed => state.completed(TerminationReason::HookRequested),
        ExecutionStatus::Failed => state.failed(TerminationReason::HookRequested),
    }
}

#[cfg(test)]
mod tests;
