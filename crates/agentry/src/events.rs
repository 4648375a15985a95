//! Lifecycle notifications.
//!
//! An [`EventEmitter`] is handed to the pipeline, drivers and tool executor
//! when an agent is built. It fans each [`AgentEvent`] out to its listeners
//! synchronously. An emitter without listeners does nothing, and no control
//! flow ever depends on a listener.
//!
//! ```rust
//! use agentry::events::{AgentEvent, EventEmitter};
//!
//! let (events, mut rx) = EventEmitter::channel();
//! events.emit(AgentEvent::PartialResponse { text: "Hel".into() });
//! assert!(matches!(rx.try_recv(), Ok(AgentEvent::PartialResponse { .. })));
//! ```

use std::fmt;
use std::sync::Arc;

use agentry_core::{StopReason, Usage};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::ErrorKind;
use crate::state::{ExecutionStatus, StepType, TerminationReason};

/// A lifecycle notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[non_exhaustive]
pub enum AgentEvent {
    /// `BeforeExecution` finished.
    ExecutionStarted {
        /// Messages in the conversation.
        message_count: usize,
    },
    /// A step is about to run.
    StepStarted {
        /// 1-based step number within the run.
        step: u32,
    },
    /// A request is about to be sent to the backend.
    InferenceRequested {
        /// Messages in the request.
        message_count: usize,
        /// Tools offered to the model.
        tool_count: usize,
    },
    /// A streamed text delta arrived.
    PartialResponse {
        /// The delta.
        text: String,
    },
    /// The backend answered.
    InferenceCompleted {
        /// Model that served the request.
        model: String,
        /// Tokens consumed.
        usage: Usage,
        /// Why generation ended.
        stop_reason: StopReason,
        /// Number of tool calls requested.
        tool_calls: usize,
    },
    /// A tool is about to be invoked.
    ToolCallStarted {
        /// Call id.
        call_id: String,
        /// Tool name.
        tool: String,
    },
    /// A hook blocked a tool call.
    ToolCallBlocked {
        /// Call id.
        call_id: String,
        /// Tool name.
        tool: String,
        /// Block reason.
        reason: String,
    },
    /// A tool call finished.
    ToolCallCompleted {
        /// Call id.
        call_id: String,
        /// Tool name.
        tool: String,
        /// Whether it succeeded.
        success: bool,
        /// Milliseconds spent.
        duration_ms: i64,
    },
    /// A model decision or argument set was rejected.
    ValidationFailed {
        /// Why.
        message: String,
    },
    /// A step was recorded.
    StepCompleted {
        /// 1-based step number within the run.
        step: u32,
        /// What the step produced.
        step_type: StepType,
    },
    /// A runtime error reached `OnError`.
    ErrorOccurred {
        /// Category.
        kind: ErrorKind,
        /// Description.
        message: String,
    },
    /// `AfterExecution` finished.
    ExecutionFinished {
        /// Final status.
        status: ExecutionStatus,
        /// Steps in history.
        steps: usize,
        /// Why the run stopped.
        termination: Option<TerminationReason>,
    },
}

/// Receives [`AgentEvent`]s. Any `Fn(&AgentEvent) + Send + Sync` qualifies.
pub trait EventListener: Send + Sync {
    /// Called once per event, on the emitting task.
    fn on_event(&self, event: &AgentEvent);
}

impl<F> EventListener for F
where
    F: Fn(&AgentEvent) + Send + Sync,
{
    fn on_event(&self, event: &AgentEvent) {
        self(event);
    }
}

/// Fans events out to listeners. Cloning shares the listener list.
#[derive(Clone, Default)]
pub struct EventEmitter {
    listeners: Vec<Arc<dyn EventListener>>,
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl EventEmitter {
    /// An emitter with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener.
    #[must_use]
    pub fn subscribe(mut self, listener: impl EventListener + 'static) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    /// An emitter that forwards every event into an unbounded channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let emitter = Self::new().subscribe(move |event: &AgentEvent| {
            // A dropped receiver just means nobody is listening any more.
            let _ = tx.send(event.clone());
        });
        (emitter, rx)
    }

    /// Whether there are no listeners.
    pub fn is_silent(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Delivers `event` to every listener in subscription order.
    pub fn emit(&self, event: AgentEvent) {
        for listener in &self.listeners {
            listener.on_event(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_silent_emitter_is_noop() {
        let events = EventEmitter::new();
        assert!(events.is_silent());
        events.emit(AgentEvent::StepStarted { step: 1 });
    }

    #[test]
    fn test_listeners_called_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (log.clone(), log.clone());
        let events = EventEmitter::new()
            .subscribe(move |_: &AgentEvent| a.lock().unwrap().push("a"))
            .subscribe(move |_: &AgentEvent| b.lock().unwrap().push("b"));
        events.emit(AgentEvent::StepStarted { step: 1 });
        assert_eq!(*log.lock().unwrap(), ["a", "b"]);
    }

    #[test]
    fn test_channel_receives_events() {
        let (events, mut rx) = EventEmitter::channel();
        events.emit(AgentEvent::StepStarted { step: 1 });
        events.emit(AgentEvent::StepCompleted {
            step: 1,
            step_type: StepType::FinalResponse,
        });
        assert_eq!(rx.try_recv().unwrap(), AgentEvent::StepStarted { step: 1 });
        assert!(matches!(
            rx.try_recv().unwrap(),
            AgentEvent::StepCompleted { step: 1, .. }
        ));
    }

    #[test]
    fn test_channel_survives_dropped_receiver() {
        let (events, rx) = EventEmitter::channel();
        drop(rx);
        events.emit(AgentEvent::StepStarted { step: 1 });
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(AgentEvent::ToolCallBlocked {
            call_id: "tc".into(),
            tool: "shell".into(),
            reason: "Dangerous command blocked".into(),
        })
        .unwrap();
        assert_eq!(json["event"], "tool_call_blocked");
        assert_eq!(json["tool"], "shell");
    }
}
