//! Tests for the execution pipeline.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use agentry_core::mock::{MockError, MockProvider};
use agentry_core::test_helpers::{open_tool, tool_call};
use agentry_core::{ChatMessage, ToolCall};
use chrono::Utc;
use serde_json::{Value, json};

use super::*;
use crate::driver::ToolCallingDriver;
use crate::events::AgentEvent;
use crate::hooks::FnHook;
use crate::state::StepType;
use crate::tool::{ToolError, tool_fn};

/// Requests one `noop` call per step, forever.
#[derive(Default)]
struct AlwaysTool {
    steps: AtomicUsize,
}

impl Driver for AlwaysTool {
    fn name(&self) -> &str {
        "always_tool"
    }

    fn use_tools<'a>(
        &'a self,
        state: &'a ExecutionState,
        tools: &'a ToolRegistry,
        executor: &'a ToolExecutor,
    ) -> Pin<Box<dyn Future<Output = Result<Step, AgentError>> + Send + 'a>> {
        Box::pin(async move {
            let n = self.steps.fetch_add(1, Ordering::SeqCst);
            let call = ToolCall::new(format!("tc_{n}"), "noop", json!({}));
            let executions = executor.execute(vec![call], state, tools).await?;
            Ok(Step::tool_execution(
                state.inference_messages(),
                vec![ChatMessage::tool_result(format!("tc_{n}"), "ok")],
                executions,
                None,
                Utc::now(),
            ))
        })
    }
}

/// Fails every step with a clone of the given error.
struct Broken(fn() -> AgentError);

impl Driver for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    fn use_tools<'a>(
        &'a self,
        _state: &'a ExecutionState,
        _tools: &'a ToolRegistry,
        _executor: &'a ToolExecutor,
    ) -> Pin<Box<dyn Future<Output = Result<Step, AgentError>> + Send + 'a>> {
        let err = (self.0)();
        Box::pin(async move { Err(err) })
    }
}

fn noop_tools() -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools.register(tool_fn(open_tool("noop"), |_: Value| async { Ok("ok") }));
    tools
}

fn mock_pipeline(mock: &Arc<MockProvider>, tools: ToolRegistry) -> ExecutionPipeline {
    ExecutionPipeline::new(Arc::new(ToolCallingDriver::new(mock.clone())), tools)
}

fn logging_handler(name: &'static str, log: Arc<Mutex<Vec<&'static str>>>) -> impl PhaseHandler {
    FnPhaseHandler::new(name, move |_, state| {
        log.lock().unwrap().push(name);
        Ok(state)
    })
}

// ── Phases ──────────────────────────────────────────────────────

#[test]
fn test_phase_display_and_trigger() {
    assert_eq!(Phase::ExecuteStep.to_string(), "execute_step");
    assert_eq!(Phase::OnError.trigger(), Some(HookTrigger::OnError));
    assert_eq!(Phase::ShouldContinue.trigger(), None);
    assert_eq!(serde_json::to_value(Phase::AfterStep).unwrap(), "after_step");
}

// ── Continuation ────────────────────────────────────────────────

#[tokio::test]
async fn test_steps_limit_stops_endless_tool_calls() {
    let driver = Arc::new(AlwaysTool::default());
    let pipeline = ExecutionPipeline::new(driver.clone(), noop_tools())
        .with_criteria(ContinuationCriteria::new().with(ToolCallPresenceCheck).with(StepsLimit(3)));

    let done = pipeline.run(ExecutionState::from_user("go")).await.unwrap();
    assert_eq!(done.step_count(), 3);
    assert_eq!(driver.steps.load(Ordering::SeqCst), 3);
    assert_ne!(done.status(), ExecutionStatus::Running);
    assert!(matches!(
        done.termination(),
        Some(TerminationReason::Criterion { name, .. }) if name == "steps_limit"
    ));
    assert!(done.buffer().is_empty());
}

#[tokio::test]
async fn test_failed_state_never_continues() {
    let pipeline = ExecutionPipeline::new(Arc::new(AlwaysTool::default()), noop_tools())
        .with_criteria(ContinuationCriteria::new());
    let failed = ExecutionState::from_user("x").failed(TerminationReason::HookRequested);
    assert!(matches!(pipeline.check_continuation(failed), Continuation::Stop(_)));
}

#[tokio::test]
async fn test_cancellation_between_steps() {
    let token = CancellationToken::new();
    let cancel_after_first = {
        let token = token.clone();
        FnHook::new("cancel", [HookTrigger::AfterStep], move |ctx| {
            token.cancel();
            ctx
        })
    };
    let pipeline = ExecutionPipeline::new(Arc::new(AlwaysTool::default()), noop_tools())
        .with_hooks(HookStack::new().with(cancel_after_first, 0))
        .with_cancellation(token);

    let done = pipeline.run(ExecutionState::from_user("go")).await.unwrap();
    assert_eq!(done.step_count(), 1);
    assert_eq!(done.termination(), Some(&TerminationReason::Cancelled));
    assert_eq!(done.status(), ExecutionStatus::Completed);
}

// ── Ordering ────────────────────────────────────────────────────

#[tokio::test]
async fn test_handlers_run_in_order_then_hooks() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let hook_log = log.clone();
    let hook = FnHook::new("hook", [HookTrigger::AfterStep], move |ctx| {
        hook_log.lock().unwrap().push("hook");
        ctx
    });
    let mock = Arc::new(MockProvider::named("mock", "m"));
    mock.queue_text("done");

    let pipeline = mock_pipeline(&mock, ToolRegistry::new())
        .with_hooks(HookStack::new().with(hook, 1000))
        .with_handler(Phase::AfterStep, Arc::new(logging_handler("first", log.clone())))
        .with_handler(Phase::AfterStep, Arc::new(logging_handler("second", log.clone())))
        .with_handler(Phase::ShouldContinue, Arc::new(logging_handler("ignored", log.clone())));

    pipeline.run(ExecutionState::from_user("hi")).await.unwrap();
    assert_eq!(*log.lock().unwrap(), ["first", "second", "hook"]);
}

#[tokio::test]
async fn test_execute_step_handler_sees_recorded_step() {
    let mock = Arc::new(MockProvider::named("mock", "m"));
    mock.queue_text("done");
    let seen = Arc::new(AtomicUsize::new(usize::MAX));
    let seen_in = seen.clone();
    let handler = FnPhaseHandler::new("count", move |_, state: ExecutionState| {
        seen_in.store(state.step_count(), Ordering::SeqCst);
        Ok(state)
    });

    mock_pipeline(&mock, ToolRegistry::new())
        .with_handler(Phase::ExecuteStep, Arc::new(handler))
        .run(ExecutionState::from_user("hi"))
        .await
        .unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

// ── Hooks ending the run ────────────────────────────────────────

#[tokio::test]
async fn test_before_step_hook_can_end_run() {
    let mock = Arc::new(MockProvider::named("mock", "m"));
    let stop = FnHook::new("stop", [HookTrigger::BeforeStep], |ctx| {
        let state = ctx.state.with_status(ExecutionStatus::Completed);
        ctx.with_state(state)
    });
    let done = mock_pipeline(&mock, ToolRegistry::new())
        .with_hooks(HookStack::new().with(stop, 0))
        .run(ExecutionState::from_user("hi"))
        .await
        .unwrap();

    assert!(mock.recorded_calls().is_empty());
    assert_eq!(done.step_count(), 0);
    assert_eq!(done.termination(), Some(&TerminationReason::HookRequested));
}

// ── Errors ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_model_error_fails_run_with_history() {
    let mock = Arc::new(MockProvider::named("mock", "m"));
    mock.queue_error(MockError::Auth("bad key".into()));
    let (events, mut rx) = EventEmitter::channel();

    let done = mock_pipeline(&mock, ToolRegistry::new())
        .with_events(events)
        .run(ExecutionState::from_user("hi"))
        .await
        .unwrap();

    assert_eq!(done.status(), ExecutionStatus::Failed);
    assert_eq!(done.step_count(), 1);
    let step = &done.steps()[0];
    assert_eq!(step.step_type, StepType::Error);
    assert_eq!(step.failure.as_ref().unwrap().kind, ErrorKind::Model);
    assert!(matches!(
        done.termination(),
        Some(TerminationReason::Error { kind: ErrorKind::Model, .. })
    ));
    assert_eq!(done.messages(), [ChatMessage::user("hi")]);

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let AgentEvent::ErrorOccurred { kind, .. } = event {
            kinds.push(kind);
        }
    }
    assert_eq!(kinds, [ErrorKind::Model]);
}

#[tokio::test]
async fn test_rate_limit_is_retried() {
    let mock = Arc::new(MockProvider::named("mock", "m"));
    mock.queue_error(MockError::RateLimited);
    mock.queue_text("finally");

    let done = mock_pipeline(&mock, ToolRegistry::new())
        .run(ExecutionState::from_user("hi"))
        .await
        .unwrap();

    assert_eq!(done.status(), ExecutionStatus::Completed);
    let types: Vec<StepType> = done.steps().iter().map(|s| s.step_type).collect();
    assert_eq!(types, [StepType::Error, StepType::FinalResponse]);
    assert_eq!(done.stats().total_failures, 1);
    assert_eq!(done.final_text().as_deref(), Some("finally"));
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let mock = Arc::new(MockProvider::named("mock", "m"));
    for _ in 0..5 {
        mock.queue_error(MockError::Timeout { elapsed_ms: 10 });
    }
    let done = mock_pipeline(&mock, ToolRegistry::new())
        .with_error_policy(ErrorPolicy::retry_all(2))
        .run(ExecutionState::from_user("hi"))
        .await
        .unwrap();

    assert_eq!(done.status(), ExecutionStatus::Failed);
    assert_eq!(done.step_count(), 3);
    assert_eq!(mock.remaining(), 2);
}

#[tokio::test]
async fn test_programming_error_propagates() {
    let pipeline = ExecutionPipeline::new(
        Arc::new(Broken(|| AgentError::ContractViolation("bad state".into()))),
        ToolRegistry::new(),
    );
    let err = pipeline.run(ExecutionState::from_user("hi")).await.unwrap_err();
    assert!(matches!(err, AgentError::ContractViolation(_)));
}

#[tokio::test]
async fn test_failing_handler_goes_to_on_error() {
    let mock = Arc::new(MockProvider::named("mock", "m"));
    let handler = FnPhaseHandler::new("explode", |phase, _| {
        Err(AgentError::Handler {
            phase,
            message: "boom".into(),
        })
    });
    let saw_failure = Arc::new(Mutex::new(None));
    let saw = saw_failure.clone();
    let on_error = FnHook::new("on_error", [HookTrigger::OnError], move |ctx| {
        *saw.lock().unwrap() = ctx.failure.clone();
        ctx
    });

    let done = mock_pipeline(&mock, ToolRegistry::new())
        .with_handler(Phase::BeforeStep, Arc::new(handler))
        .with_hooks(HookStack::new().with(on_error, 0))
        .run(ExecutionState::from_user("hi"))
        .await
        .unwrap();

    assert!(mock.recorded_calls().is_empty());
    assert_eq!(done.status(), ExecutionStatus::Failed);
    let failure = saw_failure.lock().unwrap().clone().unwrap();
    assert_eq!(failure.kind, ErrorKind::Unknown);
    assert_eq!(failure.message, "before_step handler failed: boom");
}

#[tokio::test]
async fn test_tool_failures_follow_policy() {
    let mut tools = ToolRegistry::new();
    tools.register(tool_fn(open_tool("flaky"), |_: Value| async {
        Err::<String, _>(ToolError::new("down"))
    }));
    let mock = Arc::new(MockProvider::named("mock", "m"));
    mock.queue_tool_calls(vec![tool_call("1", "flaky", json!({}))]);
    mock.queue_text("gave up");

    let ignoring = mock_pipeline(&mock, tools.clone())
        .run(ExecutionState::from_user("hi"))
        .await
        .unwrap();
    assert_eq!(ignoring.status(), ExecutionStatus::Completed);
    assert_eq!(ignoring.stats().total_failures, 1);

    mock.queue_tool_calls(vec![tool_call("2", "flaky", json!({}))]);
    let stopping = mock_pipeline(&mock, tools)
        .with_error_policy(ErrorPolicy::stop_on_any_error())
        .run(ExecutionState::from_user("hi"))
        .await
        .unwrap();
    assert_eq!(stopping.status(), ExecutionStatus::Failed);
    assert!(matches!(
        stopping.termination(),
        Some(TerminationReason::Error { kind: ErrorKind::Tool, .. })
    ));
}

#[tokio::test]
async fn test_ignored_tool_failures_leave_retry_budget_intact() {
    let mut tools = ToolRegistry::new();
    tools.register(tool_fn(open_tool("flaky"), |_: Value| async {
        Err::<String, _>(ToolError::new("nope"))
    }));
    let mock = Arc::new(MockProvider::named("mock", "m"));
    for i in 0..3 {
        mock.queue_tool_calls(vec![tool_call(&i.to_string(), "flaky", json!({}))]);
    }
    mock.queue_error(MockError::RateLimited);
    mock.queue_text("Done.");

    let done = mock_pipeline(&mock, tools)
        .run(ExecutionState::from_user("hi"))
        .await
        .unwrap();

    let types: Vec<StepType> = done.steps().iter().map(|s| s.step_type).collect();
    assert_eq!(
        types,
        [
            StepType::ToolExecution,
            StepType::ToolExecution,
            StepType::ToolExecution,
            StepType::Error,
            StepType::FinalResponse,
        ]
    );
    assert_eq!(done.status(), ExecutionStatus::Completed);
    assert_eq!(done.termination(), Some(&TerminationReason::FinalResponse));
    assert_eq!(done.stats().total_failures, 4);
}

#[tokio::test]
async fn test_retry_streak_is_per_error_kind() {
    let mock = Arc::new(MockProvider::named("mock", "m"));
    mock.queue_error(MockError::RateLimited);
    mock.queue_error(MockError::Timeout { elapsed_ms: 5 });
    mock.queue_error(MockError::RateLimited);
    mock.queue_text("Done.");

    let done = mock_pipeline(&mock, ToolRegistry::new())
        .with_error_policy(ErrorPolicy::retry_all(1))
        .run(ExecutionState::from_user("hi"))
        .await
        .unwrap();

    assert_eq!(done.status(), ExecutionStatus::Completed);
    assert_eq!(done.step_count(), 4);
}

// ── Buffer ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_keep_tool_traces_folds_buffer() {
    let mock = Arc::new(MockProvider::named("mock", "m"));
    mock.queue_tool_calls(vec![tool_call("1", "noop", json!({}))]);
    mock.queue_text("done");

    let done = mock_pipeline(&mock, noop_tools())
        .with_keep_tool_traces(true)
        .run(ExecutionState::from_user("hi"))
        .await
        .unwrap();
    assert_eq!(done.messages().len(), 4);
    assert!(done.messages()[2].is_tool_result());
    assert!(done.buffer().is_empty());
}

#[tokio::test]
async fn test_events_bracket_the_run() {
    let mock = Arc::new(MockProvider::named("mock", "m"));
    mock.queue_text("done");
    let (events, mut rx) = EventEmitter::channel();

    mock_pipeline(&mock, ToolRegistry::new())
        .with_events(events)
        .run(ExecutionState::from_user("hi"))
        .await
        .unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    assert_eq!(seen.first(), Some(&AgentEvent::ExecutionStarted { message_count: 1 }));
    assert!(seen.contains(&AgentEvent::StepCompleted {
        step: 1,
        step_type: StepType::FinalResponse,
    }));
    assert!(matches!(
        seen.last(),
        Some(AgentEvent::ExecutionFinished {
            status: ExecutionStatus::Completed,
            steps: 1,
            termination: Some(TerminationReason::FinalResponse),
        })
    ));
}
