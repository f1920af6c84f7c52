//! Tool contract consumed by the execution core.
//!
//! The core never implements tools; it only knows a tool's name, its
//! declared dependencies, whether its results may be cached, and how to
//! validate and execute it.

use serde_json::Value;

// === Errors ===

/// Errors a tool (or the machinery around it) can produce.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Execution failed: {message}")]
    ExecutionFailed { message: String },

    #[error("Timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Tool not available: {message}")]
    NotAvailable { message: String },

    #[error("Permission denied: {message}")]
    PermissionDenied { message: String },

    #[error("Cancelled: {message}")]
    Cancelled { message: String },
}

impl ToolError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        ToolError::InvalidInput {
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        ToolError::MissingField {
            field: field.into(),
        }
    }

    pub fn execution_failed(message: impl Into<String>) -> Self {
        ToolError::ExecutionFailed {
            message: message.into(),
        }
    }

    pub fn not_available(message: impl Into<String>) -> Self {
        ToolError::NotAvailable {
            message: message.into(),
        }
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        ToolError::PermissionDenied {
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        ToolError::Cancelled {
            message: message.into(),
        }
    }

    /// Whether a retry may plausibly succeed.
    ///
    /// Transient failures (execution errors, timeouts) are retryable;
    /// validation, availability, and permission errors are not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ToolError::ExecutionFailed { .. } | ToolError::Timeout { .. }
        )
    }
}

// === Results ===

/// Output of a single tool execution, as produced by the tool itself.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn failure(content: impl Into<String>) -> Self {
        Self {
            success: false,
            content: content.into(),
            metadata: None,
        }
    }

    /// Serialize a value as the result content.
    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            success: true,
            content: serde_json::to_string(value)?,
            metadata: None,
        })
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

// === Tool trait ===

/// Contract implemented by external tools.
///
/// `declared_dependencies` names other tools in the same scheduling batch
/// that must complete before this one runs. `cacheable` marks tools whose
/// results are safe to reuse for identical parameters (non-idempotent
/// tools, e.g. shell execution, must return `false`).
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn declared_dependencies(&self) -> &[&str] {
        &[]
    }

    fn cacheable(&self) -> bool {
        false
    }

    /// Validate parameters before dispatch. A validation failure is
    /// surfaced as a non-retryable failed result, never executed.
    fn validate_params(&self, params: &Value) -> Result<(), ToolError> {
        let _ = params;
        Ok(())
    }

    async fn execute(&self, params: Value) -> Result<ToolResult, ToolError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification_matches_policy() {
        assert!(ToolError::execution_failed("socket reset").is_retryable());
        assert!(ToolError::Timeout { seconds: 5 }.is_retryable());
        assert!(!ToolError::invalid_input("bad params").is_retryable());
        assert!(!ToolError::missing_field("path").is_retryable());
        assert!(!ToolError::permission_denied("no").is_retryable());
        assert!(!ToolError::not_available("gone").is_retryable());
    }

    #[test]
    fn json_result_serializes_content() {
        let result = ToolResult::json(&serde_json::json!({"ok": true})).unwrap();
        assert!(result.success);
        assert!(result.content.contains("\"ok\":true"));
    }
}
