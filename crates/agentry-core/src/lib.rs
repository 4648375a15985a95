//! # agentry-core
//!
//! Provider-agnostic vocabulary shared by the agentry orchestration engine
//! and by inference backends.
//!
//! This crate defines what flows across the boundary between the agent loop
//! and a language-model backend: messages, tool calls and results, responses,
//! streaming events, usage accounting and the backend error type. It contains
//! no vendor wire formats and no transport: a backend implements [`Provider`]
//! (or its object-safe counterpart [`DynProvider`]) and the engine only ever
//! talks to that trait.
//!
//! # Architecture
//!
//! ```text
//!   ┌────────────────────────────────────────┐
//!   │                agentry                 │  state, hooks, pipeline,
//!   │  (Agent, ExecutionPipeline, Drivers)   │  drivers, tool executor
//!   └───────────────────┬────────────────────┘
//!                       │ DynProvider / ChatParams / ChatResponse
//!                       ▼
//!   ┌────────────────────────────────────────┐
//!   │             agentry-core               │  ← you are here
//!   └────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`chat`] | Messages, content blocks, tool calls/results and responses |
//! | [`error`] | [`LlmError`], the backend/transport failure type |
//! | [`provider`] | The [`Provider`] trait and request parameters |
//! | [`stream`] | Partial-response events and the [`ChatStream`] alias |
//! | [`usage`] | Token counts |
//! | `mock` | Queue-based [`MockProvider`](mock::MockProvider) (`test-utils`) |
//! | `test_helpers` | Sample responses and message shorthands (`test-utils`) |

#![warn(missing_docs)]

pub mod chat;
pub mod error;
pub mod provider;
pub mod stream;
pub mod usage;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_helpers;

pub use chat::{ChatMessage, ChatResponse, ChatRole, ContentBlock, StopReason, ToolCall, ToolResult};
pub use error::LlmError;
pub use provider::{
    Capability, ChatParams, DynProvider, JsonSchema, Provider, ProviderMetadata, ToolChoice,
    ToolDefinition,
};
pub use stream::{ChatStream, StreamEvent};
pub use usage::Usage;
