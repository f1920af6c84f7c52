//! Execution core for an LLM coding agent.
//!
//! The crate is the engine room between a streaming model API and a set of
//! local tools: it extracts tool calls from model output as it streams,
//! schedules them with dependency awareness, caches repeatable results,
//! and drives the multi-turn conversation loop. It has no UI and no HTTP
//! client of its own; embedders supply a [`llm::ModelClient`] and a
//! [`tools::ToolRegistry`] and consume [`core::Event`]s.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use agent_core::config::CoreConfig;
//! use agent_core::core::{Op, spawn_engine};
//! use agent_core::llm::ModelClient;
//! use agent_core::tools::ToolRegistry;
//!
//! # async fn run(client: Arc<dyn ModelClient>) -> anyhow::Result<()> {
//! let registry = ToolRegistry::builder().build();
//! let handle = spawn_engine(CoreConfig::default(), registry, client);
//! handle.send(Op::UserMessage { content: "hello".into() }).await?;
//! while let Some(event) = handle.next_event().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error_taxonomy;
pub mod llm;
pub mod tools;

pub use crate::config::CoreConfig;
pub use crate::core::{
    AbortReason, ConversationStatus, ConversationTurn, Engine, EngineHandle, Event, Op,
    spawn_engine,
};
pub use crate::llm::{ChunkStream, ModelClient};
pub use crate::tools::{Tool, ToolError, ToolRegistry, ToolResult};
