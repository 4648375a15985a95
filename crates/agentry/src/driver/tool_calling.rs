use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use agentry_core::{ChatMessage, ChatParams, ContentBlock, DynProvider, ToolChoice};
use chrono::Utc;
use tracing::{debug, instrument};

use super::{Driver, Inference, InferenceMode, echoes_arguments};
use crate::error::AgentError;
use crate::events::EventEmitter;
use crate::state::{ExecutionState, InferenceInfo, Step};
use crate::tool::{ToolExecutor, ToolRegistry};

/// Relies on the backend's native tool-call blocks.
///
/// A response without tool calls is a final answer. Otherwise every
/// requested call goes through the executor and the step's outputs are,
/// per call, an assistant announcement followed by the tool result.
///
/// ```rust
/// use std::sync::Arc;
/// use agentry::driver::{Driver, ToolCallingDriver};
/// use agentry_core::{ToolChoice, mock::MockProvider};
///
/// let driver = ToolCallingDriver::new(Arc::new(MockProvider::named("mock", "m")))
///     .with_tool_choice(ToolChoice::Required)
///     .with_system_prompt("Answer with tools when you can.");
/// assert_eq!(driver.name(), "tool_calling");
/// ```
#[derive(Debug, Clone)]
pub struct ToolCallingDriver {
    inference: Inference,
    cached_context: Vec<ChatMessage>,
    system_prompt: Option<String>,
    tool_choice: ToolChoice,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl ToolCallingDriver {
    /// A blocking driver over `provider`.
    pub fn new(provider: Arc<dyn DynProvider>) -> Self {
        Self {
            inference: Inference::new(provider),
            cached_context: Vec::new(),
            system_prompt: None,
            tool_choice: ToolChoice::Auto,
            temperature: None,
            max_tokens: None,
        }
    }

    /// Sets blocking or streaming inference.
    #[must_use]
    pub fn with_inference_mode(mut self, mode: InferenceMode) -> Self {
        self.inference.set_mode(mode);
        self
    }

    /// Sets the event emitter.
    #[must_use]
    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.inference.set_events(events);
        self
    }

    /// Messages sent ahead of the conversation on every request without
    /// being part of the state.
    #[must_use]
    pub fn with_cached_context(mut self, messages: Vec<ChatMessage>) -> Self {
        self.cached_context = messages;
        self
    }

    /// Sets the backend-level system prompt.
    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Sets the tool-use policy sent alongside non-empty tool sets.
    #[must_use]
    pub fn with_tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = choice;
        self
    }

    /// Sets the sampling temperature.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Caps output tokens per request.
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    fn params(&self, state: &ExecutionState, tools: &ToolRegistry) -> ChatParams {
        let mut messages = self.cached_context.clone();
        messages.extend(state.inference_messages());
        let (tools, tool_choice) = if tools.is_empty() {
            (None, None)
        } else {
            (Some(tools.definitions()), Some(self.tool_choice.clone()))
        };
        ChatParams {
            messages,
            tools,
            tool_choice,
            system: self.system_prompt.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            ..ChatParams::default()
        }
    }

    #[instrument(skip_all, fields(messages = state.inference_messages().len()))]
    async fn step(
        &self,
        state: &ExecutionState,
        tools: &ToolRegistry,
        executor: &ToolExecutor,
    ) -> Result<Step, AgentError> {
        let started_at = Utc::now();
        let params = self.params(state, tools);
        let response = self.inference.call(&params).await?;
        let inference = InferenceInfo::from(&response);
        let input_messages = params.messages;

        let (calls, rest) = response.partition_content();
        let text: String = rest
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();

        if calls.is_empty() {
            let outputs = if text.is_empty() {
                Vec::new()
            } else if echoes_arguments(&text, state.buffer().tool_calls()) {
                debug!("suppressed final text echoing tool arguments");
                Vec::new()
            } else {
                vec![ChatMessage::assistant(text)]
            };
            return Ok(Step::final_response(
                input_messages,
                outputs,
                Some(inference),
                started_at,
            ));
        }

        let mut preamble = if text.is_empty() {
            None
        } else if echoes_arguments(&text, calls.iter()) {
            debug!("suppressed preamble echoing tool arguments");
            None
        } else {
            Some(text)
        };

        let executions = executor.execute(calls, state, tools).await?;
        let mut outputs = Vec::with_capacity(executions.len() * 2);
        for execution in &executions {
            outputs.push(ChatMessage::tool_announcement(
                preamble.take(),
                execution.tool_call.clone(),
            ));
            outputs.push(ChatMessage::tool_result_full(execution.to_tool_result()));
        }
        Ok(Step::tool_execution(
            input_messages,
            outputs,
            executions,
            Some(inference),
            started_at,
        ))
    }
}

impl Driver for ToolCallingDriver {
    fn name(&self) -> &str {
        "tool_calling"
    }

    fn use_tools<'a>(
        &'a self,
        state: &'a ExecutionState,
        tools: &'a ToolRegistry,
        executor: &'a ToolExecutor,
    ) -> Pin<Box<dyn Future<Output = Result<Step, AgentError>> + Send + 'a>> {
        Box::pin(self.step(state, tools, executor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{StepType, ToolExecution};
    use crate::tool::tool_fn;
    use agentry_core::mock::{MockError, MockProvider};
    use agentry_core::test_helpers::{open_tool, tool_call};
    use agentry_core::{ChatResponse, ChatRole, StopReason, Usage};
    use serde_json::{Value, json};
    use std::collections::HashMap;

    fn search_tools() -> ToolRegistry {
        let mut tools = ToolRegistry::new();
        tools.register(tool_fn(open_tool("search"), |_: Value| async { Ok("result") }));
        tools
    }

    fn driver(mock: &Arc<MockProvider>) -> ToolCallingDriver {
        ToolCallingDriver::new(mock.clone())
    }

    #[tokio::test]
    async fn test_no_tool_calls_is_final_response() {
        let mock = Arc::new(MockProvider::named("mock", "m"));
        mock.queue_text("Done.");
        let state = ExecutionState::from_user("hi");

        let step = driver(&mock)
            .use_tools(&state, &search_tools(), &ToolExecutor::default())
            .await
            .unwrap();
        assert_eq!(step.step_type, StepType::FinalResponse);
        assert_eq!(step.output_messages, [ChatMessage::assistant("Done.")]);
        assert_eq!(step.inference.unwrap().usage, Usage::new(10, 5));
    }

    #[tokio::test]
    async fn test_tool_calls_are_executed_and_formatted() {
        let mock = Arc::new(MockProvider::named("mock", "m"));
        mock.queue_tool_calls(vec![
            tool_call("1", "search", json!({"q": "x"})),
            tool_call("2", "missing", json!({})),
        ]);
        let state = ExecutionState::from_user("Use the tool");

        let step = driver(&mock)
            .use_tools(&state, &search_tools(), &ToolExecutor::default())
            .await
            .unwrap();
        assert_eq!(step.step_type, StepType::ToolExecution);
        assert_eq!(step.tool_executions.len(), 2);
        assert!(step.tool_executions[0].is_success());
        assert_eq!(step.tool_executions[1].error(), Some("Unknown tool: missing"));

        let roles: Vec<ChatRole> = step.output_messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            [ChatRole::Assistant, ChatRole::Tool, ChatRole::Assistant, ChatRole::Tool]
        );
        let results: Vec<_> = step
            .tool_executions
            .iter()
            .map(ToolExecution::to_tool_result)
            .collect();
        assert!(!results[0].is_error);
        assert!(results[1].is_error);
    }

    #[tokio::test]
    async fn test_empty_registry_omits_tool_fields() {
        let mock = Arc::new(MockProvider::named("mock", "m"));
        mock.queue_text("ok");
        let d = driver(&mock).with_system_prompt("sys").with_max_tokens(64);
        d.use_tools(
            &ExecutionState::from_user("hi"),
            &ToolRegistry::new(),
            &ToolExecutor::default(),
        )
        .await
        .unwrap();

        let params = &mock.recorded_calls()[0];
        assert!(params.tools.is_none());
        assert!(params.tool_choice.is_none());
        assert_eq!(params.system.as_deref(), Some("sys"));
        assert_eq!(params.max_tokens, Some(64));
    }

    #[tokio::test]
    async fn test_cached_context_prefixes_messages() {
        let mock = Arc::new(MockProvider::named("mock", "m"));
        mock.queue_text("ok");
        let d = driver(&mock)
            .with_cached_context(vec![ChatMessage::system("cached")])
            .with_tool_choice(ToolChoice::Required);
        d.use_tools(
            &ExecutionState::from_user("hi"),
            &search_tools(),
            &ToolExecutor::default(),
        )
        .await
        .unwrap();

        let params = &mock.recorded_calls()[0];
        assert_eq!(params.messages[0], ChatMessage::system("cached"));
        assert_eq!(params.messages[1], ChatMessage::user("hi"));
        assert_eq!(params.tool_choice, Some(ToolChoice::Required));
        assert_eq!(params.tools.as_ref().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_echoed_preamble_is_dropped() {
        let mock = Arc::new(MockProvider::named("mock", "m"));
        let call = tool_call("1", "search", json!({"q": "x"}));
        mock.queue_response(ChatResponse {
            content: vec![
                ContentBlock::Text(r#"{"q":"x"}"#.into()),
                ContentBlock::ToolCall(call),
            ],
            usage: Usage::default(),
            stop_reason: StopReason::ToolUse,
            model: "m".into(),
            metadata: HashMap::new(),
        });

        let step = driver(&mock)
            .use_tools(
                &ExecutionState::from_user("hi"),
                &search_tools(),
                &ToolExecutor::default(),
            )
            .await
            .unwrap();
        assert!(step.output_messages[0].text().is_none());
    }

    #[tokio::test]
    async fn test_echoed_final_text_is_suppressed() {
        let mock = Arc::new(MockProvider::named("mock", "m"));
        mock.queue_text(r#"{"q": "x"}"#);
        let call = tool_call("1", "search", json!({"q": "x"}));
        let state = ExecutionState::from_user("hi").with_buffered([
            ChatMessage::tool_announcement(None, call),
            ChatMessage::tool_result("1", "result"),
        ]);

        let step = driver(&mock)
            .use_tools(&state, &search_tools(), &ToolExecutor::default())
            .await
            .unwrap();
        assert!(step.is_final());
        assert!(step.output_messages.is_empty());
    }

    #[tokio::test]
    async fn test_backend_error_propagates() {
        let mock = Arc::new(MockProvider::named("mock", "m"));
        mock.queue_error(MockError::RateLimited);
        let err = driver(&mock)
            .use_tools(
                &ExecutionState::from_user("hi"),
                &search_tools(),
                &ToolExecutor::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::RateLimit);
    }
}
