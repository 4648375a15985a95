//! Tools and their execution.
//!
//! # Architecture
//!
//! ```text
//!   ToolHandler     ─ one tool: definition (name, schema) + execute fn
//!       │
//!   ToolRegistry    ─ ordered, name-keyed handlers
//!       │
//!   ToolExecutor    ─ runs a step's calls: hook pre-check, unknown-tool and
//!                     schema checks, sequential or parallel invocation,
//!                     request-order join
//! ```
//!
//! # Example
//!
//! ```rust
//! use agentry::tool::{tool_fn, ToolError, ToolRegistry};
//! use agentry_core::{JsonSchema, ToolDefinition};
//! use serde_json::{json, Value};
//!
//! let mut registry = ToolRegistry::new();
//! registry.register(tool_fn(
//!     ToolDefinition {
//!         name: "search".into(),
//!         description: "Search the index".into(),
//!         parameters: JsonSchema::new(json!({
//!             "type": "object",
//!             "properties": {"q": {"type": "string"}},
//!             "required": ["q"]
//!         })),
//!     },
//!     |args: Value| async move {
//!         let q = args["q"].as_str().ok_or_else(|| ToolError::new("missing q"))?;
//!         Ok(format!("results for {q}"))
//!     },
//! ));
//! assert_eq!(registry.names(), ["search"]);
//! ```

mod error;
mod executor;
mod handler;
mod helpers;
mod output;
mod registry;

pub use error::ToolError;
pub use executor::ToolExecutor;
pub use handler::{FnToolHandler, ToolHandler};
pub use helpers::tool_fn;
pub use output::ToolOutput;
pub use registry::ToolRegistry;
