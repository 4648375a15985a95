//! Fixtures for tests of code built on `agentry-core` types.
//!
//! Enabled by the `test-utils` feature so downstream crates can share them.

use std::collections::HashMap;

use serde_json::Value;

use crate::chat::{ChatMessage, ChatResponse, ContentBlock, StopReason, ToolCall};
use crate::mock::MockProvider;
use crate::provider::{JsonSchema, ToolDefinition};
use crate::usage::Usage;

/// A text-only final response with [`sample_usage`].
pub fn sample_response(text: &str) -> ChatResponse {
    ChatResponse {
        content: vec![ContentBlock::Text(text.into())],
        usage: sample_usage(),
        stop_reason: StopReason::EndTurn,
        model: "test-model".into(),
        metadata: HashMap::new(),
    }
}

/// A response requesting the given tool calls.
pub fn sample_tool_response(calls: Vec<ToolCall>) -> ChatResponse {
    ChatResponse {
        content: calls.into_iter().map(ContentBlock::ToolCall).collect(),
        usage: sample_usage(),
        stop_reason: StopReason::ToolUse,
        model: "test-model".into(),
        metadata: HashMap::new(),
    }
}

/// 100 input / 50 output tokens.
pub fn sample_usage() -> Usage {
    Usage::new(100, 50)
}

/// Shorthand for [`ToolCall::new`].
pub fn tool_call(id: &str, name: &str, arguments: Value) -> ToolCall {
    ToolCall::new(id, name, arguments)
}

/// A tool definition accepting any object.
pub fn open_tool(name: &str) -> ToolDefinition {
    ToolDefinition {
        name: name.into(),
        description: format!("{name} tool"),
        parameters: JsonSchema::new(serde_json::json!({"type": "object"})),
    }
}

/// Shorthand for [`ChatMessage::user`].
pub fn user_msg(text: &str) -> ChatMessage {
    ChatMessage::user(text)
}

/// A [`MockProvider`] named `"mock"` serving `"test-model"`.
pub fn mock_provider() -> MockProvider {
    MockProvider::named("mock", "test-model")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatRole;
    use crate::provider::Provider;

    #[test]
    fn test_sample_responses() {
        assert_eq!(sample_response("hi").stop_reason, StopReason::EndTurn);
        let r = sample_tool_response(vec![tool_call("1", "x", serde_json::json!({}))]);
        assert_eq!(r.stop_reason, StopReason::ToolUse);
        assert!(r.has_tool_calls());
    }

    #[test]
    fn test_fixtures() {
        assert_eq!(user_msg("hi").role, ChatRole::User);
        assert_eq!(open_tool("search").name, "search");
        assert_eq!(Provider::metadata(&mock_provider()).model, "test-model");
    }
}
