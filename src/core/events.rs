//! Events emitted by the core engine to its caller.
//!
//! These events flow from the engine to the embedding client (CLI, editor
//! extension) via a channel, enabling non-blocking, real-time updates.

use serde_json::Value;

use super::resolver::ResolveError;

/// Terminal status for a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationStatus {
    /// The model produced a final answer with no further tool calls.
    Completed,
    /// The loop stopped early; see the accompanying [`AbortReason`].
    Aborted,
}

/// Why a conversation aborted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    TurnLimitExceeded { max_turns: u32 },
    Cancelled,
    /// Consecutive turns produced only failing tool calls.
    Stuck { failing_turns: u32 },
    /// Cycle or unknown dependency in a requested batch.
    Scheduling(ResolveError),
    /// The model stream failed or stalled beyond recovery.
    Stream { message: String },
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::TurnLimitExceeded { max_turns } => {
                write!(f, "turn limit of {max_turns} exceeded")
            }
            AbortReason::Cancelled => write!(f, "cancelled"),
            AbortReason::Stuck { failing_turns } => {
                write!(f, "no progress after {failing_turns} consecutive failing turns")
            }
            AbortReason::Scheduling(err) => write!(f, "scheduling error: {err}"),
            AbortReason::Stream { message } => write!(f, "model stream error: {message}"),
        }
    }
}

/// Events emitted by the engine.
#[derive(Debug, Clone)]
pub enum Event {
    // === Streaming Events ===
    /// A conversation turn has started.
    TurnStarted { turn_index: u32 },

    /// Incremental model text delta.
    MessageDelta { turn_index: u32, content: String },

    /// The turn finished streaming and dispatching.
    TurnComplete { turn_index: u32, tool_calls: usize },

    // === Tool Events ===
    /// Tool call recognized in the stream.
    ToolCallStarted {
        id: String,
        name: String,
        arguments: Value,
    },

    /// Tool call finished (including cache hits and failures).
    ToolCallComplete {
        id: String,
        name: String,
        success: bool,
        content: String,
        duration_ms: u64,
        from_cache: bool,
    },

    // === Lifecycle ===
    /// The conversation reached a terminal state.
    ConversationEnded {
        status: ConversationStatus,
        reason: Option<AbortReason>,
    },

    // === System Events ===
    /// An error occurred.
    Error { message: String, recoverable: bool },

    /// Status message for display.
    Status { message: String },
}

impl Event {
    /// Create a new error event
    pub fn error(message: impl Into<String>, recoverable: bool) -> Self {
        Event::Error {
            message: message.into(),
            recoverable,
        }
    }

    /// Create a new status event
    pub fn status(message: impl Into<String>) -> Self {
        Event::Status {
            message: message.into(),
        }
    }
}
