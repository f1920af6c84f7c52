//! Shared error taxonomy across the scheduler, tools, and engine.
//!
//! Typed errors stay typed inside each subsystem; the envelope is the
//! uniform shape used when an error crosses a subsystem boundary or is
//! surfaced to an embedder.

use crate::core::resolver::ResolveError;
use crate::tools::spec::ToolError;

/// Broad category for typed error handling and policy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Timeout,
    InvalidInput,
    Parse,
    Tool,
    Scheduling,
    Cancelled,
    Internal,
}

/// Severity hint for UI and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Unified envelope used when crossing subsystem boundaries.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorEnvelope {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub recoverable: bool,
    pub code: String,
    pub message: String,
}

impl ErrorEnvelope {
    #[must_use]
    pub fn new(
        category: ErrorCategory,
        severity: ErrorSeverity,
        recoverable: bool,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            severity,
            recoverable,
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&ToolError> for ErrorEnvelope {
    fn from(value: &ToolError) -> Self {
        let message = value.to_string();
        match value {
            ToolError::InvalidInput { .. } => Self::new(
                ErrorCategory::InvalidInput,
                ErrorSeverity::Error,
                false,
                "tool_invalid_input",
                message,
            ),
            ToolError::MissingField { .. } => Self::new(
                ErrorCategory::InvalidInput,
                ErrorSeverity::Error,
                false,
                "tool_missing_field",
                message,
            ),
            ToolError::ExecutionFailed { .. } => Self::new(
                ErrorCategory::Tool,
                ErrorSeverity::Error,
                true,
                "tool_execution_failed",
                message,
            ),
            ToolError::Timeout { seconds } => Self::new(
                ErrorCategory::Timeout,
                ErrorSeverity::Warning,
                true,
                format!("tool_timeout_{seconds}s"),
                message,
            ),
            ToolError::NotAvailable { .. } => Self::new(
                ErrorCategory::Tool,
                ErrorSeverity::Error,
                false,
                "tool_not_available",
                message,
            ),
            ToolError::PermissionDenied { .. } => Self::new(
                ErrorCategory::Tool,
                ErrorSeverity::Error,
                false,
                "tool_permission_denied",
                message,
            ),
            ToolError::Cancelled { .. } => Self::new(
                ErrorCategory::Cancelled,
                ErrorSeverity::Info,
                false,
                "tool_cancelled",
                message,
            ),
        }
    }
}

impl From<&ResolveError> for ErrorEnvelope {
    fn from(value: &ResolveError) -> Self {
        let message = value.to_string();
        match value {
            ResolveError::Cycle { .. } => Self::new(
                ErrorCategory::Scheduling,
                ErrorSeverity::Error,
                false,
                "schedule_cycle",
                message,
            ),
            ResolveError::UnknownDependency { .. } => Self::new(
                ErrorCategory::Scheduling,
                ErrorSeverity::Error,
                false,
                "schedule_unknown_dependency",
                message,
            ),
        }
    }
}
