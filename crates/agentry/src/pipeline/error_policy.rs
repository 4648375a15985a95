use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// What to do about one category of runtime failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorDecision {
    /// Fail the run.
    Stop,
    /// Keep going while consecutive failures stay within `max_retries`.
    Retry,
    /// Keep going.
    Ignore,
}

/// Per-category decisions for runtime failures.
///
/// Retry counting is all this layer does; backoff and request re-sending
/// belong to the transport.
///
/// ```rust
/// use agentry::pipeline::{ErrorDecision, ErrorPolicy};
/// use agentry::ErrorKind;
///
/// let policy = ErrorPolicy::default();
/// assert_eq!(policy.decision(ErrorKind::RateLimit), ErrorDecision::Retry);
/// assert!(policy.should_continue(ErrorKind::RateLimit, 3));
/// assert!(!policy.should_continue(ErrorKind::RateLimit, 4));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorPolicy {
    /// Backend failures other than rate limits and timeouts.
    pub on_model_error: ErrorDecision,
    /// Rate-limited backend requests.
    pub on_rate_limit: ErrorDecision,
    /// Backend timeouts.
    pub on_timeout: ErrorDecision,
    /// Invalid model decisions.
    pub on_validation_error: ErrorDecision,
    /// Steps with failed tool executions.
    pub on_tool_error: ErrorDecision,
    /// Everything else.
    pub on_unknown_error: ErrorDecision,
    /// Consecutive failures tolerated by [`ErrorDecision::Retry`].
    pub max_retries: u32,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self {
            on_model_error: ErrorDecision::Stop,
            on_rate_limit: ErrorDecision::Retry,
            on_timeout: ErrorDecision::Retry,
            on_validation_error: ErrorDecision::Retry,
            on_tool_error: ErrorDecision::Ignore,
            on_unknown_error: ErrorDecision::Stop,
            max_retries: 3,
        }
    }
}

impl ErrorPolicy {
    /// Every failure ends the run, including failed tool executions.
    pub fn stop_on_any_error() -> Self {
        Self::uniform(ErrorDecision::Stop, 0)
    }

    /// Every failure is retried up to `max_retries` consecutive times.
    pub fn retry_all(max_retries: u32) -> Self {
        Self::uniform(ErrorDecision::Retry, max_retries)
    }

    /// The default policy, spelled out: tool failures never end the run.
    pub fn ignore_tool_errors() -> Self {
        Self {
            on_tool_error: ErrorDecision::Ignore,
            ..Self::default()
        }
    }

    /// The default policy with tool failures retried up to `max_retries`
    /// consecutive steps.
    pub fn retry_tool_errors(max_retries: u32) -> Self {
        Self {
            on_tool_error: ErrorDecision::Retry,
            max_retries,
            ..Self::default()
        }
    }

    fn uniform(decision: ErrorDecision, max_retries: u32) -> Self {
        Self {
            on_model_error: decision,
            on_rate_limit: decision,
            on_timeout: decision,
            on_validation_error: decision,
            on_tool_error: decision,
            on_unknown_error: decision,
            max_retries,
        }
    }

    /// The decision for `kind`.
    pub fn decision(&self, kind: ErrorKind) -> ErrorDecision {
        match kind {
            ErrorKind::Model => self.on_model_error,
            ErrorKind::RateLimit => self.on_rate_limit,
            ErrorKind::Timeout => self.on_timeout,
            ErrorKind::Validation => self.on_validation_error,
            ErrorKind::Tool => self.on_tool_error,
            ErrorKind::Unknown => self.on_unknown_error,
        }
    }

    /// Whether the run may go on after a `kind` failure, given the
    /// consecutive failure count including this one.
    pub fn should_continue(&self, kind: ErrorKind, consecutive_failures: u32) -> bool {
        match self.decision(kind) {
            ErrorDecision::Stop => false,
            ErrorDecision::Retry => consecutive_failures <= self.max_retries,
            ErrorDecision::Ignore => true,
        }
    }
}
