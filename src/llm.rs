//! Model client seam.
//!
//! The engine is model-agnostic: it consumes a stream of text chunks and
//! never inspects provider wire formats. Implementations adapt a concrete
//! API (or a scripted fixture in tests) to this trait.

use std::pin::Pin;

use anyhow::Result;
use futures_util::Stream;

use crate::core::history::ConversationTurn;

/// Stream of raw text chunks from the model.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// A streaming model backend.
#[async_trait::async_trait]
pub trait ModelClient: Send + Sync {
    /// Provider name for logs and status lines.
    fn provider_name(&self) -> &str;

    /// Open a streaming response for the given conversation.
    ///
    /// Chunks are arbitrary text slices; tool-call payloads may be split
    /// across chunk boundaries and the caller reassembles them.
    async fn stream_response(&self, turns: &[ConversationTurn]) -> Result<ChunkStream>;
}
