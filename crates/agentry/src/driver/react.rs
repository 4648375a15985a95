use std::fmt::Write as _;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use agentry_core::{ChatMessage, ChatParams, DynProvider, ToolCall};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use super::{Driver, Inference, InferenceMode};
use crate::error::{AgentError, ErrorKind};
use crate::events::{AgentEvent, EventEmitter};
use crate::state::{ExecutionState, InferenceInfo, Step, ToolOutcome, value_text};
use crate::tool::{ToolExecutor, ToolRegistry};

const FINALIZE_REQUEST: &str =
    "Write your final answer for the user as plain text. Do not use JSON.";

/// Reason, act, observe.
///
/// The model is asked for one JSON decision per turn instead of native
/// tool-call blocks:
///
/// ```text
/// {"type": "call",  "thought": "...", "tool": "search", "args": {"q": "x"}}
/// {"type": "final", "thought": "...", "answer": "..."}
/// ```
///
/// Calls are validated against the registry before anything runs. A reply
/// that cannot be used becomes a validation error step whose raw text and
/// corrective feedback are shown to the model on the next turn. Tool
/// results come back as `Observation:` user messages.
#[derive(Debug, Clone)]
pub struct ReActDriver {
    inference: Inference,
    cached_context: Vec<ChatMessage>,
    instructions: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    finalize_via_inference: bool,
}

#[derive(Debug, Deserialize)]
struct Decision {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    thought: Option<String>,
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    args: Option<Value>,
    #[serde(default)]
    answer: Option<Value>,
}

#[derive(Debug, PartialEq)]
enum Action {
    Call {
        thought: Option<String>,
        tool: String,
        args: Value,
    },
    Final {
        thought: Option<String>,
        answer: String,
    },
}

/// The span from the first `{` to the last `}`, which tolerates code fences
/// and chatter around the object.
fn json_span(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (start < end).then(|| &raw[start..=end])
}

fn parse_decision(raw: &str, tools: &ToolRegistry) -> Result<Action, String> {
    let span = json_span(raw).ok_or_else(|| "the reply contains no JSON object".to_owned())?;
    let decision: Decision =
        serde_json::from_str(span).map_err(|e| format!("the reply is not a valid decision: {e}"))?;
    match decision.kind.as_str() {
        "call" => {
            let tool = decision
                .tool
                .filter(|t| !t.is_empty())
                .ok_or_else(|| "a 'call' decision needs a 'tool' field".to_owned())?;
            if !tools.contains(&tool) {
                return Err(format!(
                    "unknown tool '{tool}'; available tools: {}",
                    tools.names().join(", ")
                ));
            }
            Ok(Action::Call {
                thought: decision.thought,
                tool,
                args: decision.args.unwrap_or_else(|| json!({})),
            })
        }
        "final" => {
            let answer = decision
                .answer
                .filter(|a| !a.is_null())
                .ok_or_else(|| "a 'final' decision needs an 'answer' field".to_owned())?;
            Ok(Action::Final {
                thought: decision.thought,
                answer: value_text(&answer),
            })
        }
        other => Err(format!(
            "unknown decision type '{other}'; expected 'call' or 'final'"
        )),
    }
}

fn observation(outcome: &ToolOutcome) -> String {
    match outcome {
        ToolOutcome::Success { value } => format!("Observation: {}", value_text(value)),
        ToolOutcome::Failure { error } => format!("Observation: error: {error}"),
    }
}

impl ReActDriver {
    /// A blocking driver over `provider`.
    pub fn new(provider: Arc<dyn DynProvider>) -> Self {
        Self {
            inference: Inference::new(provider),
            cached_context: Vec::new(),
            instructions: None,
            temperature: None,
            max_tokens: None,
            finalize_via_inference: false,
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

    /// Messages sent ahead of the conversation on every request.
    #[must_use]
    pub fn with_cached_context(mut self, messages: Vec<ChatMessage>) -> Self {
        self.cached_context = messages;
        self
    }

    /// Task instructions placed before the decision protocol in the system
    /// prompt.
    #[must_use]
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
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

    /// Re-issues final answers through a second, plain-text request.
    #[must_use]
    pub fn with_finalize_via_inference(mut self, enabled: bool) -> Self {
        self.finalize_via_inference = enabled;
        self
    }

    fn system_prompt(&self, tools: &ToolRegistry) -> String {
        let mut prompt = String::new();
        if let Some(instructions) = &self.instructions {
            prompt.push_str(instructions);
            prompt.push_str("\n\n");
        }
        prompt.push_str("Work step by step. You can use these tools:\n");
        for def in tools.definitions() {
            let _ = writeln!(
                prompt,
                "- {}: {}\n  arguments schema: {}",
                def.name,
                def.description,
                def.parameters.as_value()
            );
        }
        prompt.push_str(
            "\nReply with exactly one JSON object and nothing else, in one of these forms:\n\
             {\"type\": \"call\", \"thought\": \"<reasoning>\", \
             \"tool\": \"<tool name>\", \"args\": {<arguments>}}\n\
             {\"type\": \"final\", \"thought\": \"<reasoning>\", \
             \"answer\": \"<answer for the user>\"}\n\
             Tool results are returned to you as messages starting with \"Observation:\".",
        );
        prompt
    }

    fn params(&self, messages: Vec<ChatMessage>, system: String) -> ChatParams {
        ChatParams {
            messages,
            system: Some(system),
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
        let mut messages = self.cached_context.clone();
        messages.extend(state.inference_messages());
        let params = self.params(messages, self.system_prompt(tools));

        let response = self.inference.call(&params).await?;
        let info = InferenceInfo::from(&response);
        let raw = response.text().unwrap_or_default();
        let inputs = params.messages;

        let action = match parse_decision(&raw, tools) {
            Ok(action) => action,
            Err(message) => return Ok(self.rejected(inputs, raw, message, info, started_at)),
        };

        match action {
            Action::Call {
                thought,
                tool,
                args,
            } => {
                let id = format!("react_{:016x}", rand::random::<u64>());
                debug!(%tool, %id, "decision: call");
                let executions = executor
                    .execute(vec![ToolCall::new(id, tool, args)], state, tools)
                    .await?;
                let observations = executions
                    .iter()
                    .map(|e| observation(&e.result))
                    .collect::<Vec<_>>()
                    .join("\n");
                let outputs = vec![ChatMessage::assistant(raw), ChatMessage::user(observations)];
                let step =
                    Step::tool_execution(inputs, outputs, executions, Some(info), started_at);
                Ok(match thought {
                    Some(thought) => step.with_thought(thought),
                    None => step,
                })
            }
            Action::Final { thought, answer } => {
                debug!("decision: final");
                let (answer, info) = if self.finalize_via_inference {
                    self.finalize(&inputs, &raw, answer, info).await?
                } else {
                    (answer, info)
                };
                let step = Step::final_response(
                    inputs,
                    vec![ChatMessage::assistant(answer)],
                    Some(info),
                    started_at,
                );
                Ok(match thought {
                    Some(thought) => step.with_thought(thought),
                    None => step,
                })
            }
        }
    }

    /// Asks for the final answer again as plain text, with tools omitted.
    /// Falls back to the decision's answer if the reply is empty.
    async fn finalize(
        &self,
        inputs: &[ChatMessage],
        raw: &str,
        answer: String,
        first: InferenceInfo,
    ) -> Result<(String, InferenceInfo), AgentError> {
        let mut messages = inputs.to_vec();
        messages.push(ChatMessage::assistant(raw));
        messages.push(ChatMessage::user(FINALIZE_REQUEST));
        let params = ChatParams {
            messages,
            system: self.instructions.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            ..ChatParams::default()
        };
        let response = self.inference.call(&params).await?;
        let mut info = InferenceInfo::from(&response);
        info.usage = first.usage + info.usage;
        let text = response
            .text()
            .map(|t| t.trim().to_owned())
            .filter(|t| !t.is_empty())
            .unwrap_or(answer);
        Ok((text, info))
    }

    fn rejected(
        &self,
        inputs: Vec<ChatMessage>,
        raw: String,
        message: String,
        info: InferenceInfo,
        started_at: DateTime<Utc>,
    ) -> Step {
        warn!(%message, "invalid decision");
        self.inference.events().emit(AgentEvent::ValidationFailed {
            message: message.clone(),
        });
        let feedback = format!(
            "Your last reply could not be used: {message}. \
             Reply with a single JSON object as described."
        );
        Step::error(ErrorKind::Validation, message, inputs, started_at)
            .with_outputs(vec![ChatMessage::assistant(raw), ChatMessage::user(feedback)])
            .with_inference(info)
    }
}

impl Driver for ReActDriver {
    fn name(&self) -> &str {
        "react"
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
    use crate::state::StepType;
    use crate::tool::tool_fn;
    use agentry_core::mock::MockProvider;
    use agentry_core::test_helpers::open_tool;
    use agentry_core::Usage;

    fn tools() -> ToolRegistry {
        let mut tools = ToolRegistry::new();
        tools.register(tool_fn(open_tool("search"), |args: Value| async move {
            Ok(format!("found {}", args["q"].as_str().unwrap_or("?")))
        }));
        tools
    }

    #[test]
    fn test_parse_call() {
        let raw = r#"```json
{"type": "call", "thought": "look it up", "tool": "search", "args": {"q": "x"}}
```"#;
        assert_eq!(
            parse_decision(raw, &tools()).unwrap(),
            Action::Call {
                thought: Some("look it up".into()),
                tool: "search".into(),
                args: json!({"q": "x"}),
            }
        );
    }

    #[test]
    fn test_parse_final_with_structured_answer() {
        let action = parse_decision(r#"{"type": "final", "answer": {"n": 1}}"#, &tools()).unwrap();
        assert_eq!(
            action,
            Action::Final {
                thought: None,
                answer: r#"{"n":1}"#.into(),
            }
        );
    }

    #[test]
    fn test_parse_rejections() {
        let tools = tools();
        let cases = [
            ("no json here", "no JSON object"),
            ("{not json}", "not a valid decision"),
            (r#"{"type": "think"}"#, "unknown decision type 'think'"),
            (r#"{"type": "call"}"#, "needs a 'tool' field"),
            (
                r#"{"type": "call", "tool": "shell"}"#,
                "unknown tool 'shell'; available tools: search",
            ),
            (r#"{"type": "final"}"#, "needs an 'answer' field"),
        ];
        for (raw, expected) in cases {
            let err = parse_decision(raw, &tools).unwrap_err();
            assert!(err.contains(expected), "{raw}: {err}");
        }
    }

    #[tokio::test]
    async fn test_call_decision_executes_tool() {
        let mock = Arc::new(MockProvider::named("mock", "m"));
        mock.queue_text(
            r#"{"type": "call", "thought": "search", "tool": "search", "args": {"q": "x"}}"#,
        );
        let driver = ReActDriver::new(mock.clone());

        let step = driver
            .use_tools(&ExecutionState::from_user("find x"), &tools(), &ToolExecutor::default())
            .await
            .unwrap();
        assert_eq!(step.step_type, StepType::ToolExecution);
        assert_eq!(step.thought.as_deref(), Some("search"));
        assert!(step.tool_executions[0].tool_call.id.starts_with("react_"));
        assert_eq!(step.output_messages[1].text().as_deref(), Some("Observation: found x"));

        let params = &mock.recorded_calls()[0];
        assert!(params.tools.is_none());
        assert!(params.system.as_deref().unwrap().contains("- search:"));
    }

    #[tokio::test]
    async fn test_invalid_decision_is_validation_step() {
        let mock = Arc::new(MockProvider::named("mock", "m"));
        mock.queue_text(r#"{"type": "call", "tool": "shell"}"#);
        let (events, mut rx) = EventEmitter::channel();
        let driver = ReActDriver::new(mock).with_events(events);

        let step = driver
            .use_tools(&ExecutionState::from_user("hi"), &tools(), &ToolExecutor::default())
            .await
            .unwrap();
        assert!(step.is_error());
        assert_eq!(step.failure.as_ref().unwrap().kind, ErrorKind::Validation);
        assert!(step.tool_executions.is_empty());
        assert_eq!(step.output_messages.len(), 2);

        let mut validation_failed = false;
        while let Ok(event) = rx.try_recv() {
            validation_failed |= matches!(event, AgentEvent::ValidationFailed { .. });
        }
        assert!(validation_failed);
    }

    #[tokio::test]
    async fn test_final_decision() {
        let mock = Arc::new(MockProvider::named("mock", "m"));
        mock.queue_text(r#"{"type": "final", "answer": "42"}"#);
        let step = ReActDriver::new(mock)
            .use_tools(&ExecutionState::from_user("q"), &tools(), &ToolExecutor::default())
            .await
            .unwrap();
        assert!(step.is_final());
        assert_eq!(step.output_messages, [ChatMessage::assistant("42")]);
    }

    #[tokio::test]
    async fn test_finalize_via_inference() {
        let mock = Arc::new(MockProvider::named("mock", "m"));
        mock.queue_text(r#"{"type": "final", "answer": "draft"}"#);
        mock.queue_text("The answer is 42.");
        let driver = ReActDriver::new(mock.clone()).with_finalize_via_inference(true);

        let step = driver
            .use_tools(&ExecutionState::from_user("q"), &tools(), &ToolExecutor::default())
            .await
            .unwrap();
        assert_eq!(step.output_messages, [ChatMessage::assistant("The answer is 42.")]);
        assert_eq!(step.usage(), Usage::new(20, 10));

        let second = &mock.recorded_calls()[1];
        assert!(second.tools.is_none());
        assert_eq!(
            second.messages.last().and_then(ChatMessage::text).as_deref(),
            Some(FINALIZE_REQUEST)
        );
    }
}
