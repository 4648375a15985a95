//! Tool handler trait and the closure-backed implementation.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use agentry_core::ToolDefinition;
use serde_json::Value;

use super::{ToolError, ToolOutput};

/// A tool the model can invoke.
///
/// Object-safe (boxed future) so handlers can live in a registry as
/// `Arc<dyn ToolHandler>`. For simple tools use [`tool_fn`](super::tool_fn).
///
/// ```rust
/// use agentry::tool::{ToolError, ToolHandler, ToolOutput};
/// use agentry_core::{JsonSchema, ToolDefinition};
/// use serde_json::{json, Value};
/// use std::future::Future;
/// use std::pin::Pin;
///
/// struct Clock;
///
/// impl ToolHandler for Clock {
///     fn definition(&self) -> ToolDefinition {
///         ToolDefinition {
///             name: "clock".into(),
///             description: "Current UTC time".into(),
///             parameters: JsonSchema::new(json!({"type": "object"})),
///         }
///     }
///
///     fn execute<'a>(
///         &'a self,
///         _args: Value,
///     ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, ToolError>> + Send + 'a>> {
///         Box::pin(async { Ok(ToolOutput::from("12:00")) })
///     }
/// }
/// ```
pub trait ToolHandler: Send + Sync {
    /// Name, description and argument schema.
    fn definition(&self) -> ToolDefinition;

    /// Runs the tool.
    fn execute<'a>(
        &'a self,
        args: Value,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, ToolError>> + Send + 'a>>;
}

/// A tool handler backed by an async closure. Created by
/// [`tool_fn`](super::tool_fn).
pub struct FnToolHandler<F> {
    pub(crate) definition: ToolDefinition,
    pub(crate) handler: F,
}

impl<F> fmt::Debug for FnToolHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnToolHandler")
            .field("name", &self.definition.name)
            .finish_non_exhaustive()
    }
}

impl<F, Fut, O> ToolHandler for FnToolHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<O, ToolError>> + Send + 'static,
    O: Into<ToolOutput> + Send + 'static,
{
    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }

    fn execute<'a>(
        &'a self,
        args: Value,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, ToolError>> + Send + 'a>> {
        let fut = (self.handler)(args);
        Box::pin(async move { fut.await.map(Into::into) })
    }
}
