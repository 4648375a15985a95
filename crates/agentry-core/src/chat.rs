//! Conversation messages, tool calls and backend responses.
//!
//! A [`ChatMessage`] is a role plus an ordered list of [`ContentBlock`]s.
//! Text, tool-call announcements and tool results all travel as blocks so
//! that a single message type covers every turn the agent loop produces.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::usage::Usage;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    /// Instructions that frame the conversation.
    System,
    /// The human (or calling program).
    User,
    /// The model.
    Assistant,
    /// Output of a tool invocation.
    Tool,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Backend-assigned identifier linking the call to its result.
    pub id: String,
    /// Name of the tool to invoke.
    pub name: String,
    /// JSON arguments for the tool.
    pub arguments: Value,
}

impl ToolCall {
    /// Creates a tool call.
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Compact JSON rendering of the arguments.
    pub fn arguments_json(&self) -> String {
        self.arguments.to_string()
    }
}

/// The outcome of a tool invocation, as fed back to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The [`ToolCall::id`] this result answers.
    pub tool_call_id: String,
    /// Text content returned to the model.
    pub content: String,
    /// Whether the invocation failed.
    pub is_error: bool,
}

/// One piece of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text(String),
    /// A tool call announced by the assistant.
    ToolCall(ToolCall),
    /// The result of a previously announced tool call.
    ToolResult(ToolResult),
}

/// A single conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author of the turn.
    pub role: ChatRole,
    /// Ordered content blocks.
    pub content: Vec<ContentBlock>,
    /// Structured, application-defined annotations. Never sent to a backend
    /// by the engine itself.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl ChatMessage {
    fn text_message(role: ChatRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentBlock::Text(text.into())],
            metadata: HashMap::new(),
        }
    }

    /// A system message with a single text block.
    pub fn system(text: impl Into<String>) -> Self {
        Self::text_message(ChatRole::System, text)
    }

    /// A user message with a single text block.
    pub fn user(text: impl Into<String>) -> Self {
        Self::text_message(ChatRole::User, text)
    }

    /// An assistant message with a single text block.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text_message(ChatRole::Assistant, text)
    }

    /// A successful tool result message.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::tool_result_full(ToolResult {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            is_error: false,
        })
    }

    /// A tool result message built from a complete [`ToolResult`].
    pub fn tool_result_full(result: ToolResult) -> Self {
        Self {
            role: ChatRole::Tool,
            content: vec![ContentBlock::ToolResult(result)],
            metadata: HashMap::new(),
        }
    }

    /// An assistant message announcing a tool call, optionally preceded by
    /// text the model produced alongside it.
    pub fn tool_announcement(preamble: Option<String>, call: ToolCall) -> Self {
        let mut content = Vec::with_capacity(2);
        if let Some(text) = preamble.filter(|t| !t.is_empty()) {
            content.push(ContentBlock::Text(text));
        }
        content.push(ContentBlock::ToolCall(call));
        Self {
            role: ChatRole::Assistant,
            content,
            metadata: HashMap::new(),
        }
    }

    /// Attaches a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Concatenated text blocks, or `None` if the message has none.
    pub fn text(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.concat())
        }
    }

    /// Tool calls announced in this message.
    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.content.iter().filter_map(|b| match b {
            ContentBlock::ToolCall(c) => Some(c),
            _ => None,
        })
    }

    /// Whether any block is a tool result.
    pub fn is_tool_result(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolResult(_)))
    }
}

/// Why the backend stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural end of the turn.
    EndTurn,
    /// The model wants tools to run.
    ToolUse,
    /// The output-token limit was hit.
    MaxTokens,
    /// A stop sequence matched.
    StopSequence,
    /// Backend-specific reason.
    Other(String),
}

/// A complete backend response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Text and tool-call blocks in generation order.
    pub content: Vec<ContentBlock>,
    /// Token usage for this request.
    pub usage: Usage,
    /// Why generation ended.
    pub stop_reason: StopReason,
    /// Model that served the request.
    pub model: String,
    /// Backend-specific extras.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl ChatResponse {
    /// A response with no content, used when a run ends before any call.
    pub fn empty() -> Self {
        Self {
            content: Vec::new(),
            usage: Usage::default(),
            stop_reason: StopReason::EndTurn,
            model: String::new(),
            metadata: HashMap::new(),
        }
    }

    /// Concatenated text blocks, or `None` if there are none.
    pub fn text(&self) -> Option<String> {
        let mut out = String::new();
        let mut any = false;
        for block in &self.content {
            if let ContentBlock::Text(t) = block {
                out.push_str(t);
                any = true;
            }
        }
        any.then_some(out)
    }

    /// References to every tool call in the response.
    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolCall(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    /// Whether the model requested at least one tool call.
    pub fn has_tool_calls(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolCall(_)))
    }

    /// Splits the response into owned tool calls and the remaining blocks.
    pub fn partition_content(self) -> (Vec<ToolCall>, Vec<ContentBlock>) {
        let mut calls = Vec::new();
        let mut other = Vec::new();
        for block in self.content {
            match block {
                ContentBlock::ToolCall(c) => calls.push(c),
                b => other.push(b),
            }
        }
        (calls, other)
    }
}
