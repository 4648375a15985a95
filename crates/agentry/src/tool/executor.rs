//! Tool call execution with hook pre-checks.

use std::sync::Arc;

use agentry_core::ToolCall;
use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, instrument, warn};

use super::{ToolHandler, ToolRegistry};
use crate::error::AgentError;
use crate::events::{AgentEvent, EventEmitter};
use crate::hooks::{HookContext, HookStack, HookTrigger, PendingToolCall};
use crate::state::{ExecutionState, ToolExecution};

enum Slot {
    Done(ToolExecution),
    Ready {
        call: ToolCall,
        handler: Arc<dyn ToolHandler>,
    },
}

/// Runs the tool calls of one step.
///
/// For each call, in request order:
///
/// 1. `BeforeToolUse` hooks may block the call or rewrite its arguments.
///    A blocked call becomes a failed [`ToolExecution`] carrying the reason
///    and the tool is never invoked.
/// 2. Unknown tools and (with the `schema` feature) arguments that fail the
///    tool's schema become failed executions.
/// 3. Approved calls run sequentially, or concurrently when parallel
///    execution is enabled. Output order always matches request order.
/// 4. `AfterToolUse` hooks see each finished record and may replace it.
///
/// Tool failures are data. Only [`ToolError::misuse`](super::ToolError::misuse)
/// aborts, as [`AgentError::ToolMisuse`].
#[derive(Debug, Clone, Default)]
pub struct ToolExecutor {
    hooks: HookStack,
    events: EventEmitter,
    parallel: bool,
}

impl ToolExecutor {
    /// A sequential executor consulting `hooks` and reporting to `events`.
    pub fn new(hooks: HookStack, events: EventEmitter) -> Self {
        Self {
            hooks,
            events,
            parallel: false,
        }
    }

    /// Enables or disables concurrent execution of approved calls.
    #[must_use]
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Whether approved calls run concurrently.
    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    /// Executes `calls` against `tools`, returning one record per call in
    /// request order.
    #[instrument(skip_all, fields(calls = calls.len(), parallel = self.parallel))]
    pub async fn execute(
        &self,
        calls: Vec<ToolCall>,
        state: &ExecutionState,
        tools: &ToolRegistry,
    ) -> Result<Vec<ToolExecution>, AgentError> {
        let slots: Vec<Slot> = calls
            .into_iter()
            .map(|call| self.prepare(call, state, tools))
            .collect();

        let executions = if self.parallel {
            join_all(slots.into_iter().map(|slot| self.finish(slot)))
                .await
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?
        } else {
            let mut out = Vec::with_capacity(slots.len());
            for slot in slots {
                out.push(self.finish(slot).await?);
            }
            out
        };

        Ok(self.after_tool_use(executions, state))
    }

    fn prepare(&self, call: ToolCall, state: &ExecutionState, tools: &ToolRegistry) -> Slot {
        let PendingToolCall { call, blocked } = if self.hooks.handles(HookTrigger::BeforeToolUse) {
            let ctx = HookContext::for_tool_call(state.clone(), call.clone());
            self.hooks
                .dispatch(HookTrigger::BeforeToolUse, ctx)
                .tool_call
                .unwrap_or_else(|| PendingToolCall::new(call))
        } else {
            PendingToolCall::new(call)
        };

        if let Some(reason) = blocked {
            warn!(tool = %call.name, %reason, "tool call blocked");
            self.events.emit(AgentEvent::ToolCallBlocked {
                call_id: call.id.clone(),
                tool: call.name.clone(),
                reason: reason.clone(),
            });
            return Slot::Done(ToolExecution::rejected(call, reason));
        }

        let Some(handler) = tools.get(&call.name) else {
            warn!(tool = %call.name, "unknown tool requested");
            let error = format!("Unknown tool: {}", call.name);
            return Slot::Done(ToolExecution::rejected(call, error));
        };

        #[cfg(feature = "schema")]
        if let Err(detail) = handler.definition().parameters.validate(&call.arguments) {
            let message = format!("Invalid arguments for tool '{}': {detail}", call.name);
            debug!(%message, "tool arguments rejected");
            self.events.emit(AgentEvent::ValidationFailed {
                message: message.clone(),
            });
            return Slot::Done(ToolExecution::rejected(call, message));
        }

        Slot::Ready {
            handler: Arc::clone(handler),
            call,
        }
    }

    async fn finish(&self, slot: Slot) -> Result<ToolExecution, AgentError> {
        let (call, handler) = match slot {
            Slot::Done(execution) => return Ok(execution),
            Slot::Ready { call, handler } => (call, handler),
        };

        self.events.emit(AgentEvent::ToolCallStarted {
            call_id: call.id.clone(),
            tool: call.name.clone(),
        });
        let started = Utc::now();
        let result = handler.execute(call.arguments.clone()).await;
        let completed = Utc::now();

        let execution = match result {
            Ok(output) => ToolExecution::success(call, output.value, started, completed),
            Err(err) if err.is_misuse() => {
                return Err(AgentError::ToolMisuse {
                    tool: call.name,
                    message: err.message,
                });
            }
            Err(err) => {
                debug!(tool = %call.name, error = %err, "tool failed");
                ToolExecution::failure(call, err.message, started, completed)
            }
        };

        self.events.emit(AgentEvent::ToolCallCompleted {
            call_id: execution.tool_call.id.clone(),
            tool: execution.tool_call.name.clone(),
            success: execution.is_success(),
            duration_ms: execution.duration().num_milliseconds(),
        });
        Ok(execution)
    }

    fn after_tool_use(
        &self,
        executions: Vec<ToolExecution>,
        state: &ExecutionState,
    ) -> Vec<ToolExecution> {
        if !self.hooks.handles(HookTrigger::AfterToolUse) {
            return executions;
        }
        executions
            .into_iter()
            .map(|execution| {
                let ctx = HookContext::for_tool_execution(state.clone(), execution.clone());
                self.hooks
                    .dispatch(HookTrigger::AfterToolUse, ctx)
                    .tool_execution
                    .unwrap_or(execution)
            })
            .collect()
    }
}
