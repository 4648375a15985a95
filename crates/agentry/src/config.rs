//! Agent configuration.

use std::time::Duration;

use agentry_core::ToolChoice;
use serde::{Deserialize, Serialize};

use crate::driver::InferenceMode;
use crate::pipeline::{
    ContinuationCriteria, ErrorPolicy, ExecutionTimeLimit, StepsLimit, TokenUsageLimit,
    ToolCallPresenceCheck,
};

/// Settings for an [`Agent`](crate::Agent).
///
/// Every field has a default, so a JSON document only needs the fields it
/// changes:
///
/// ```rust
/// use agentry::AgentConfig;
///
/// let config = AgentConfig::from_json_str(r#"{"max_steps": 5, "timeout_ms": 30000}"#).unwrap();
/// assert_eq!(config.max_steps, 5);
/// assert!(!config.parallel_tool_execution);
/// assert_eq!(config.criteria().len(), 3);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Steps allowed per run.
    pub max_steps: u32,
    /// Total tokens allowed across recorded steps.
    pub token_budget: Option<u64>,
    /// Wall-clock limit per run, checked between steps.
    pub timeout_ms: Option<u64>,
    /// Run a step's approved tool calls concurrently.
    pub parallel_tool_execution: bool,
    /// Tool-use policy for the tool-calling driver.
    pub tool_choice: ToolChoice,
    /// Blocking or streaming inference.
    pub inference_mode: InferenceMode,
    /// Fold tool traces into the conversation on a final answer instead of
    /// discarding them.
    pub keep_tool_traces: bool,
    /// Output-token cap per request.
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Backend-level system prompt.
    pub system_prompt: Option<String>,
    /// What runtime failures do to the run.
    pub error_policy: ErrorPolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 20,
            token_budget: None,
            timeout_ms: None,
            parallel_tool_execution: false,
            tool_choice: ToolChoice::Auto,
            inference_mode: InferenceMode::Blocking,
            keep_tool_traces: false,
            max_tokens: None,
            temperature: None,
            system_prompt: None,
            error_policy: ErrorPolicy::default(),
        }
    }
}

impl AgentConfig {
    /// Parses a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// The continuation criteria these settings imply: stop on a final
    /// answer, on `max_steps`, and on the optional token and time limits.
    pub fn criteria(&self) -> ContinuationCriteria {
        let mut criteria = ContinuationCriteria::new()
            .with(ToolCallPresenceCheck)
            .with(StepsLimit(self.max_steps));
        if let Some(budget) = self.token_budget {
            criteria = criteria.with(TokenUsageLimit(budget));
        }
        if let Some(ms) = self.timeout_ms {
            criteria = criteria.with(ExecutionTimeLimit(Duration::from_millis(ms)));
        }
        criteria
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ErrorDecision;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.max_steps, 20);
        assert_eq!(config.inference_mode, InferenceMode::Blocking);
        assert_eq!(config.criteria().len(), 2);
    }

    #[test]
    fn test_from_json_nested() {
        let config = AgentConfig::from_json_str(
            r#"{
                "inference_mode": "streaming",
                "tool_choice": "required",
                "token_budget": 1000,
                "error_policy": {"on_tool_error": "stop"}
            }"#,
        )
        .unwrap();
        assert_eq!(config.inference_mode, InferenceMode::Streaming);
        assert_eq!(config.tool_choice, ToolChoice::Required);
        assert_eq!(config.error_policy.on_tool_error, ErrorDecision::Stop);
        assert_eq!(config.error_policy.max_retries, 3);
        assert_eq!(config.criteria().len(), 3);
    }

    #[test]
    fn test_unknown_mode_rejected() {
        assert!(AgentConfig::from_json_str(r#"{"inference_mode": "psychic"}"#).is_err());
    }
}
