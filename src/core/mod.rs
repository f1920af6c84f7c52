//! Engine internals: conversation loop, scheduling, caching, extraction.

pub mod cache;
pub mod engine;
pub mod events;
pub mod extractor;
pub mod history;
pub mod ops;
pub mod resolver;
pub mod scheduler;

pub use engine::{Engine, EngineHandle, spawn_engine};
pub use events::{AbortReason, ConversationStatus, Event};
pub use history::{ConversationHistory, ConversationTurn, Role};
pub use ops::Op;
