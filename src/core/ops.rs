//! Operations the caller can send to the engine.

/// Operations that can be sent to the engine.
#[derive(Debug, Clone)]
pub enum Op {
    /// Start a conversation from a user message.
    UserMessage { content: String },

    /// Drop all cached tool results.
    ClearToolCache,

    /// Cancel the in-flight conversation, if any.
    Cancel,

    /// Stop the engine loop.
    Shutdown,
}
