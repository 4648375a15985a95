//! Constructors for closure-backed tools.

use std::future::Future;

use agentry_core::ToolDefinition;
use serde_json::Value;

use super::{FnToolHandler, ToolError, ToolOutput};

/// Wraps an async closure as a [`ToolHandler`](super::ToolHandler).
///
/// ```rust
/// use agentry::tool::{tool_fn, ToolRegistry};
/// use agentry_core::{JsonSchema, ToolDefinition};
/// use serde_json::{json, Value};
///
/// let mut registry = ToolRegistry::new();
/// registry.register(tool_fn(
///     ToolDefinition {
///         name: "add".into(),
///         description: "Add two numbers".into(),
///         parameters: JsonSchema::new(json!({
///             "type": "object",
///             "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
///             "required": ["a", "b"]
///         })),
///     },
///     |args: Value| async move {
///         let a = args["a"].as_f64().unwrap_or(0.0);
///         let b = args["b"].as_f64().unwrap_or(0.0);
///         Ok(json!(a + b))
///     },
/// ));
/// assert!(registry.contains("add"));
/// ```
pub fn tool_fn<F, Fut, O>(definition: ToolDefinition, handler: F) -> FnToolHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<O, ToolError>> + Send + 'static,
    O: Into<ToolOutput> + Send + 'static,
{
    FnToolHandler {
        definition,
        handler,
    }
}
