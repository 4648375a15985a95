//! Tool output type.

use serde_json::Value;

/// Value returned by a tool handler.
///
/// Strings are sent to the model verbatim; structured values as compact
/// JSON.
///
/// ```rust
/// use agentry::tool::ToolOutput;
/// use serde_json::json;
///
/// let text = ToolOutput::from("42");
/// let data = ToolOutput::from(json!({"hits": 3}));
/// assert_eq!(text.value, json!("42"));
/// assert_eq!(data.value["hits"], 3);
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ToolOutput {
    /// The returned value.
    pub value: Value,
}

impl ToolOutput {
    /// Wraps a value.
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

impl From<String> for ToolOutput {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for ToolOutput {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<Value> for ToolOutput {
    fn from(value: Value) -> Self {
        Self { value }
    }
}
