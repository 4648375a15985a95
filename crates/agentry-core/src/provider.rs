//! Inference backend trait and request types.
//!
//! - **[`Provider`]**: what a backend implements, using native
//!   async-fn-in-traits.
//! - **[`DynProvider`]**: the object-safe mirror with boxed futures. A
//!   blanket `impl<T: Provider> DynProvider for T` means any backend can be
//!   stored as `Arc<dyn DynProvider>`, which is how the engine holds it.
//!
//! The engine sends a [`ChatParams`] and receives either a complete
//! [`ChatResponse`] or a [`ChatStream`] of partial events.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chat::{ChatMessage, ChatResponse};
use crate::error::LlmError;
use crate::stream::ChatStream;

/// The trait every inference backend implements.
///
/// Not object-safe; use [`DynProvider`] behind `dyn`.
pub trait Provider: Send + Sync {
    /// Sends a request and returns the full response.
    fn generate(
        &self,
        params: &ChatParams,
    ) -> impl Future<Output = Result<ChatResponse, LlmError>> + Send;

    /// Sends a request and returns a stream of partial responses.
    fn stream(
        &self,
        params: &ChatParams,
    ) -> impl Future<Output = Result<ChatStream, LlmError>> + Send;

    /// Static description of this backend instance.
    fn metadata(&self) -> ProviderMetadata;
}

/// Object-safe counterpart of [`Provider`].
pub trait DynProvider: Send + Sync {
    /// Boxed-future version of [`Provider::generate`].
    fn generate_boxed<'a>(
        &'a self,
        params: &'a ChatParams,
    ) -> Pin<Box<dyn Future<Output = Result<ChatResponse, LlmError>> + Send + 'a>>;

    /// Boxed-future version of [`Provider::stream`].
    fn stream_boxed<'a>(
        &'a self,
        params: &'a ChatParams,
    ) -> Pin<Box<dyn Future<Output = Result<ChatStream, LlmError>> + Send + 'a>>;

    /// Static description of this backend instance.
    fn metadata(&self) -> ProviderMetadata;
}

impl<T: Provider> DynProvider for T {
    fn generate_boxed<'a>(
        &'a self,
        params: &'a ChatParams,
    ) -> Pin<Box<dyn Future<Output = Result<ChatResponse, LlmError>> + Send + 'a>> {
        Box::pin(self.generate(params))
    }

    fn stream_boxed<'a>(
        &'a self,
        params: &'a ChatParams,
    ) -> Pin<Box<dyn Future<Output = Result<ChatStream, LlmError>> + Send + 'a>> {
        Box::pin(self.stream(params))
    }

    fn metadata(&self) -> ProviderMetadata {
        Provider::metadata(self)
    }
}

/// Describes a backend instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderMetadata {
    /// Backend name (e.g. `"mock"`).
    pub name: Cow<'static, str>,
    /// Model identifier.
    pub model: String,
    /// Context window in tokens.
    pub context_window: u64,
    /// Supported features.
    pub capabilities: HashSet<Capability>,
}

/// A feature a backend may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Capability {
    /// Native tool calling.
    Tools,
    /// Incremental streaming.
    Streaming,
    /// JSON-constrained output.
    StructuredOutput,
}

/// Parameters for one inference request.
///
/// ```rust
/// use agentry_core::{ChatMessage, ChatParams};
///
/// let params = ChatParams {
///     messages: vec![ChatMessage::user("Hello")],
///     max_tokens: Some(256),
///     ..Default::default()
/// };
/// assert!(params.tools.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChatParams {
    /// Conversation sent to the model.
    pub messages: Vec<ChatMessage>,
    /// Tools the model may call. `None` omits tool fields entirely; some
    /// backends reject an empty tool array.
    pub tools: Option<Vec<ToolDefinition>>,
    /// Tool-use policy. Only meaningful together with `tools`.
    pub tool_choice: Option<ToolChoice>,
    /// Separate system prompt for backends that accept one.
    pub system: Option<String>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Output-token cap.
    pub max_tokens: Option<u32>,
    /// Backend-specific extras.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// Controls whether and how the model uses tools.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    /// The model decides.
    #[default]
    Auto,
    /// No tool calls allowed.
    None,
    /// At least one tool call required.
    Required,
    /// This specific tool must be called.
    Specific(String),
}

/// A tool the model may invoke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Name the model uses to call the tool.
    pub name: String,
    /// What the tool does, shown to the model.
    pub description: String,
    /// JSON Schema of the arguments.
    pub parameters: JsonSchema,
}

/// A JSON Schema document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonSchema(Value);

impl JsonSchema {
    /// Wraps a raw schema value.
    pub fn new(schema: Value) -> Self {
        Self(schema)
    }

    /// The schema as JSON.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Validates `value` against the schema, returning every violation
    /// joined with `"; "`.
    #[cfg(feature = "schema")]
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        let validator = jsonschema::validator_for(&self.0)
            .map_err(|e| format!("invalid JSON schema: {e}"))?;
        let errors: Vec<String> = validator
            .iter_errors(value)
            .map(|e| e.to_string())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}
