//! # agentry
//!
//! A hookable agent loop. It repeatedly calls a language-model backend, runs
//! the tools the model asks for and decides when to stop. Third-party code
//! can observe and intercept every lifecycle point without touching the
//! loop itself.
//!
//! Backends are reached only through [`agentry_core::DynProvider`]; this
//! crate has no vendor or transport code.
//!
//! # Architecture
//!
//! ```text
//!   Agent ── run / iterate
//!     │
//!     ▼
//!   ExecutionPipeline ── phases, continuation criteria, error policy
//!     │        │
//!     │        └── HookStack ── priority-ordered interceptors
//!     ▼
//!   Driver (ToolCalling | ReAct) ── one step per call
//!     │
//!     ├── DynProvider ── inference backend
//!     └── ToolExecutor ── hook pre-checks, request-order join
//!           │
//!           └── ToolRegistry
//! ```
//!
//! Every phase passes an immutable [`ExecutionState`] along; each
//! transformation returns a new snapshot.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agentry::{Agent, ExecutionState};
//! use agentry::hooks::ToolCallGuard;
//! use agentry::tool::tool_fn;
//! use agentry_core::{JsonSchema, ToolDefinition};
//! use serde_json::{json, Value};
//!
//! # async fn example(provider: Arc<dyn agentry_core::DynProvider>) -> Result<(), agentry::AgentError> {
//! let search = tool_fn(
//!     ToolDefinition {
//!         name: "search".into(),
//!         description: "Search the index".into(),
//!         parameters: JsonSchema::new(json!({"type": "object"})),
//!     },
//!     |args: Value| async move { Ok(format!("results for {}", args["q"])) },
//! );
//!
//! let agent = Agent::builder(provider)
//!     .tool(search)
//!     .hook(ToolCallGuard::dangerous_commands(), 100)
//!     .build();
//!
//! let state = agent.run(ExecutionState::from_user("Find x")).await?;
//! println!("{:?}", state.final_text());
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`agent`] | [`Agent`], its builder and the lazy state stream |
//! | [`config`] | [`AgentConfig`], loadable from JSON |
//! | [`driver`] | The [`Driver`](driver::Driver) trait, tool-calling and ReAct drivers |
//! | [`error`] | [`AgentError`] and [`ErrorKind`] |
//! | [`events`] | Lifecycle events and the [`EventEmitter`](events::EventEmitter) |
//! | [`hooks`] | Hook trait, priority stack and built-in hooks |
//! | [`pipeline`] | Phases, continuation criteria, error policy |
//! | [`state`] | [`ExecutionState`], [`Step`], [`ToolExecution`] |
//! | [`tool`] | Tool handlers, registry and executor |

#![warn(missing_docs)]

pub mod agent;
pub mod config;
pub mod driver;
pub mod error;
pub mod events;
pub mod hooks;
pub mod pipeline;
pub mod state;
pub mod tool;

pub use agent::{Agent, AgentBuilder, AgentStream};
pub use config::AgentConfig;
pub use error::{AgentError, ErrorKind};
pub use pipeline::{ErrorPolicy, ExecutionPipeline, Phase};
pub use state::{ExecutionState, ExecutionStatus, Step, StepType, TerminationReason, ToolExecution};
