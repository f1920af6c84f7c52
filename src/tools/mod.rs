//! Tool system modules and re-exports.

// === Modules ===

pub mod registry;
pub mod spec;

// === Re-exports ===

pub use registry::{ToolRegistry, ToolRegistryBuilder};
pub use spec::{Tool, ToolError, ToolResult};
