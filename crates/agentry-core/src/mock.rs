//! Scripted provider for tests.
//!
//! [`MockProvider`] replays a queue of replies. Each `generate` or `stream`
//! call pops the next one and records the [`ChatParams`] it was given, so a
//! test can script an entire multi-step agent conversation up front and then
//! assert on exactly what the engine sent.
//!
//! ```rust
//! use agentry_core::mock::MockProvider;
//! use agentry_core::{ChatParams, Provider};
//!
//! # async fn example() {
//! let mock = MockProvider::named("mock", "test-model");
//! mock.queue_text("Hello!");
//!
//! let resp = mock.generate(&ChatParams::default()).await.unwrap();
//! assert_eq!(resp.text().as_deref(), Some("Hello!"));
//! assert_eq!(mock.recorded_calls().len(), 1);
//! # }
//! ```
//!
//! When the queue runs dry the mock answers with
//! [`LlmError::InvalidRequest`] instead of panicking, so an agent that calls
//! the model more often than scripted fails its run visibly.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::chat::{ChatResponse, ContentBlock, StopReason, ToolCall};
use crate::error::LlmError;
use crate::provider::{Capability, ChatParams, Provider, ProviderMetadata};
use crate::stream::{ChatStream, StreamEvent};
use crate::usage::Usage;

/// One scripted reply.
#[derive(Debug, Clone)]
enum Scripted {
    Response(ChatResponse),
    Error(MockError),
}

/// Cloneable stand-in for [`LlmError`], which owns boxed sources and so
/// cannot be queued directly. Converted when dequeued.
#[derive(Debug, Clone)]
pub enum MockError {
    /// Becomes [`LlmError::Http`].
    Http {
        /// Status code, if any.
        status: Option<http::StatusCode>,
        /// Message.
        message: String,
        /// Retryable flag.
        retryable: bool,
    },
    /// Becomes [`LlmError::Auth`].
    Auth(String),
    /// Becomes [`LlmError::InvalidRequest`].
    InvalidRequest(String),
    /// Becomes [`LlmError::Provider`].
    Provider {
        /// Provider code.
        code: String,
        /// Message.
        message: String,
        /// Retryable flag.
        retryable: bool,
    },
    /// Becomes [`LlmError::Timeout`].
    Timeout {
        /// Elapsed milliseconds.
        elapsed_ms: u64,
    },
    /// Becomes an HTTP 429 [`LlmError::Http`].
    RateLimited,
}

impl From<MockError> for LlmError {
    fn from(err: MockError) -> Self {
        match err {
            MockError::Http {
                status,
                message,
                retryable,
            } => Self::Http {
                status,
                message,
                retryable,
            },
            MockError::Auth(msg) => Self::Auth(msg),
            MockError::InvalidRequest(msg) => Self::InvalidRequest(msg),
            MockError::Provider {
                code,
                message,
                retryable,
            } => Self::Provider {
                code,
                message,
                retryable,
            },
            MockError::Timeout { elapsed_ms } => Self::Timeout { elapsed_ms },
            MockError::RateLimited => Self::Http {
                status: Some(http::StatusCode::TOO_MANY_REQUESTS),
                message: "rate limited".into(),
                retryable: true,
            },
        }
    }
}

/// A queue-backed [`Provider`] for unit and integration tests.
pub struct MockProvider {
    script: Mutex<VecDeque<Scripted>>,
    meta: ProviderMetadata,
    calls: Arc<Mutex<Vec<ChatParams>>>,
}

impl fmt::Debug for MockProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockProvider")
            .field("meta", &self.meta)
            .field("remaining", &self.remaining())
            .field("recorded_calls", &self.recorded_calls().len())
            .finish()
    }
}

impl MockProvider {
    /// Creates a mock with the given metadata and an empty script.
    pub fn new(meta: ProviderMetadata) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            meta,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Creates a tool-capable mock with the given name and model.
    pub fn named(name: &str, model: &str) -> Self {
        Self::new(ProviderMetadata {
            name: name.to_owned().into(),
            model: model.into(),
            context_window: 128_000,
            capabilities: HashSet::from([Capability::Tools, Capability::Streaming]),
        })
    }

    fn push(&self, item: Scripted) -> &Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(item);
        self
    }

    /// Queues a complete response.
    pub fn queue_response(&self, response: ChatResponse) -> &Self {
        self.push(Scripted::Response(response))
    }

    /// Queues a plain-text final answer.
    pub fn queue_text(&self, text: &str) -> &Self {
        self.queue_response(ChatResponse {
            content: vec![ContentBlock::Text(text.into())],
            usage: Usage::new(10, 5),
            stop_reason: StopReason::EndTurn,
            model: self.meta.model.clone(),
            metadata: HashMap::new(),
        })
    }

    /// Queues a response requesting the given tool calls.
    pub fn queue_tool_calls(&self, calls: Vec<ToolCall>) -> &Self {
        self.queue_response(ChatResponse {
            content: calls.into_iter().map(ContentBlock::ToolCall).collect(),
            usage: Usage::new(10, 5),
            stop_reason: StopReason::ToolUse,
            model: self.meta.model.clone(),
            metadata: HashMap::new(),
        })
    }

    /// Queues a failure.
    pub fn queue_error(&self, error: MockError) -> &Self {
        self.push(Scripted::Error(error))
    }

    /// Number of scripted replies not yet consumed.
    pub fn remaining(&self) -> usize {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Every [`ChatParams`] received, in call order.
    pub fn recorded_calls(&self) -> Vec<ChatParams> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn next(&self, params: &ChatParams) -> Result<ChatResponse, LlmError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(params.clone());
        let item = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match item {
            Some(Scripted::Response(resp)) => Ok(resp),
            Some(Scripted::Error(err)) => Err(err.into()),
            None => Err(LlmError::InvalidRequest(
                "MockProvider: script exhausted".into(),
            )),
        }
    }
}

/// Replays a complete response as the event sequence a streaming backend
/// would produce.
fn as_events(resp: ChatResponse) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    let mut index = 0u32;
    for block in resp.content {
        match block {
            ContentBlock::Text(t) => events.push(StreamEvent::TextDelta(t)),
            ContentBlock::ToolCall(call) => {
                events.push(StreamEvent::ToolCallStart {
                    index,
                    id: call.id.clone(),
                    name: call.name.clone(),
                });
                events.push(StreamEvent::ToolCallDelta {
                    index,
                    json_chunk: call.arguments_json(),
                });
                events.push(StreamEvent::ToolCallComplete { index, call });
                index += 1;
            }
            ContentBlock::ToolResult(_) => {}
        }
    }
    events.push(StreamEvent::Usage(resp.usage));
    events.push(StreamEvent::Done {
        stop_reason: resp.stop_reason,
    });
    events
}

impl Provider for MockProvider {
    async fn generate(&self, params: &ChatParams) -> Result<ChatResponse, LlmError> {
        self.next(params)
    }

    async fn stream(&self, params: &ChatParams) -> Result<ChatStream, LlmError> {
        let resp = self.next(params)?;
        let events = as_events(resp);
        Ok(Box::pin(futures::stream::iter(events.into_iter().map(Ok))))
    }

    fn metadata(&self) -> ProviderMetadata {
        self.meta.clone()
    }
}
