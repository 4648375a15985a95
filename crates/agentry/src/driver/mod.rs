//! Drivers: strategies that turn the current state into the next step.
//!
//! A [`Driver`] calls the inference backend, executes whatever tools the
//! model asked for through the [`ToolExecutor`] it is handed, and returns
//! one [`Step`]. The pipeline never looks inside a driver; the strategy is
//! chosen once, when the agent is built.
//!
//! | Driver | How the model asks for tools |
//! |--------|------------------------------|
//! | [`ToolCallingDriver`] | The backend's native tool-call blocks |
//! | [`ReActDriver`] | A JSON decision object in plain text |

mod react;
mod tool_calling;

pub use react::ReActDriver;
pub use tool_calling::ToolCallingDriver;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use agentry_core::{
    ChatParams, ChatResponse, ContentBlock, DynProvider, LlmError, StopReason, StreamEvent,
    ToolCall, Usage,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::AgentError;
use crate::events::{AgentEvent, EventEmitter};
use crate::state::{ExecutionState, Step};
use crate::tool::{ToolExecutor, ToolRegistry};

/// Turns state into the next step.
pub trait Driver: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Produces one step.
    ///
    /// Runtime failures may be returned as `Err` or as a
    /// [`StepType::Error`](crate::state::StepType::Error) step; the pipeline
    /// routes both to `OnError`.
    fn use_tools<'a>(
        &'a self,
        state: &'a ExecutionState,
        tools: &'a ToolRegistry,
        executor: &'a ToolExecutor,
    ) -> Pin<Box<dyn Future<Output = Result<Step, AgentError>> + Send + 'a>>;
}

/// How a driver waits for the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceMode {
    /// One request, one complete response.
    #[default]
    Blocking,
    /// Pull partial events until the stream ends, emitting
    /// [`AgentEvent::PartialResponse`] per text delta.
    Streaming,
}

/// The backend plus the plumbing every driver shares.
#[derive(Clone)]
pub(crate) struct Inference {
    provider: Arc<dyn DynProvider>,
    mode: InferenceMode,
    events: EventEmitter,
}

impl fmt::Debug for Inference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inference")
            .field("provider", &self.provider.metadata().name)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl Inference {
    pub(crate) fn new(provider: Arc<dyn DynProvider>) -> Self {
        Self {
            provider,
            mode: InferenceMode::Blocking,
            events: EventEmitter::new(),
        }
    }

    pub(crate) fn set_mode(&mut self, mode: InferenceMode) {
        self.mode = mode;
    }

    pub(crate) fn set_events(&mut self, events: EventEmitter) {
        self.events = events;
    }

    pub(crate) fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Sends `params` and waits for the terminal response.
    pub(crate) async fn call(&self, params: &ChatParams) -> Result<ChatResponse, LlmError> {
        self.events.emit(AgentEvent::InferenceRequested {
            message_count: params.messages.len(),
            tool_count: params.tools.as_ref().map_or(0, Vec::len),
        });
        let response = match self.mode {
            InferenceMode::Blocking => self.provider.generate_boxed(params).await?,
            InferenceMode::Streaming => self.collect(params).await?,
        };
        debug!(
            model = %response.model,
            tool_calls = response.tool_calls().len(),
            stop_reason = ?response.stop_reason,
            "inference completed"
        );
        self.events.emit(AgentEvent::InferenceCompleted {
            model: response.model.clone(),
            usage: response.usage.clone(),
            stop_reason: response.stop_reason.clone(),
            tool_calls: response.tool_calls().len(),
        });
        Ok(response)
    }

    /// Drains a stream one event at a time into a complete response.
    async fn collect(&self, params: &ChatParams) -> Result<ChatResponse, LlmError> {
        let mut stream = self.provider.stream_boxed(params).await?;
        let mut text = String::new();
        let mut calls: Vec<(u32, ToolCall)> = Vec::new();
        let mut usage = Usage::default();
        let mut stop_reason = StopReason::EndTurn;

        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::TextDelta(delta) => {
                    self.events.emit(AgentEvent::PartialResponse {
                        text: delta.clone(),
                    });
                    text.push_str(&delta);
                }
                StreamEvent::ToolCallComplete { index, call } => calls.push((index, call)),
                StreamEvent::Usage(u) => usage += &u,
                StreamEvent::Done { stop_reason: sr } => stop_reason = sr,
                _ => {}
            }
        }
        calls.sort_by_key(|(index, _)| *index);

        let mut content = Vec::with_capacity(calls.len() + 1);
        if !text.is_empty() {
            content.push(ContentBlock::Text(text));
        }
        content.extend(calls.into_iter().map(|(_, call)| ContentBlock::ToolCall(call)));

        Ok(ChatResponse {
            content,
            usage,
            stop_reason,
            model: self.provider.metadata().model,
            metadata: HashMap::new(),
        })
    }
}

/// Whether `text` merely repeats the arguments of one of `calls`.
///
/// Some backends copy a tool call's argument JSON into the assistant text.
/// That text is never shown to the user.
pub(crate) fn echoes_arguments<'a>(
    text: &str,
    mut calls: impl Iterator<Item = &'a ToolCall>,
) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }
    let parsed = serde_json::from_str::<Value>(trimmed).ok();
    calls.any(|call| {
        trimmed == call.arguments_json() || parsed.as_ref() == Some(&call.arguments)
    })
}
