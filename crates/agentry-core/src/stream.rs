//! Partial responses from a streaming backend.
//!
//! A backend in streaming mode yields [`StreamEvent`]s through a
//! [`ChatStream`]: text deltas, tool-call fragments, usage, and finally
//! [`Done`](StreamEvent::Done). Tool calls arrive in three phases, start →
//! argument deltas → complete; only the completed call is authoritative.

use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::chat::{StopReason, ToolCall};
use crate::error::LlmError;
use crate::usage::Usage;

/// A pinned, boxed, `Send` stream of partial responses.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, LlmError>> + Send>>;

/// One incremental piece of a streamed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum StreamEvent {
    /// A fragment of text output.
    TextDelta(String),
    /// A fragment of reasoning output.
    ReasoningDelta(String),
    /// A tool call has started.
    ToolCallStart {
        /// Position of the call within this response.
        index: u32,
        /// Backend-assigned identifier.
        id: String,
        /// Tool name.
        name: String,
    },
    /// A JSON fragment of a tool call's arguments.
    ToolCallDelta {
        /// Call index the fragment belongs to.
        index: u32,
        /// Raw JSON chunk.
        json_chunk: String,
    },
    /// A fully assembled tool call.
    ToolCallComplete {
        /// Call index.
        index: u32,
        /// The parsed call.
        call: ToolCall,
    },
    /// Usage reported so far.
    Usage(Usage),
    /// End of stream.
    Done {
        /// Why generation ended.
        stop_reason: StopReason,
    },
}
