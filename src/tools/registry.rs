//! Tool registry: explicit, injected lookup from tool name to implementation.
//!
//! The registry is passed into the scheduler and engine as a constructor
//! argument; there are no module-level singletons.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use super::spec::{Tool, ToolError, ToolResult};

/// Immutable registry of tools, indexed by name.
///
/// Cloning is cheap: handlers are shared behind `Arc`.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    // Preserves registration order for stable listings.
    order: Vec<String>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.order)
            .finish()
    }
}

impl ToolRegistry {
    #[must_use]
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::new()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Tool names in registration order.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.order
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Validate and execute a tool by name.
    pub async fn execute(&self, name: &str, params: Value) -> Result<ToolResult, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::not_available(format!("tool '{name}' is not registered")))?;
        tool.validate_params(&params)?;
        tool.execute(params).await
    }
}

/// Builder for [`ToolRegistry`]. Registering a name twice replaces the
/// earlier handler.
#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: HashMap<String, Arc<dyn Tool>>,
    order: Vec<String>,
}

impl ToolRegistryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn register(self, tool: impl Tool + 'static) -> Self {
        self.register_shared(Arc::new(tool))
    }

    #[must_use]
    pub fn register_shared(mut self, tool: Arc<dyn Tool>) -> Self {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_none() {
            self.order.push(name);
        }
        self
    }

    #[must_use]
    pub fn build(self) -> ToolRegistry {
        ToolRegistry {
            tools: self.tools,
            order: self.order,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait::async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echoes its input back"
        }

        fn validate_params(&self, params: &Value) -> Result<(), ToolError> {
            if params.get("text").is_none() {
                return Err(ToolError::missing_field("text"));
            }
            Ok(())
        }

        async fn execute(&self, params: Value) -> Result<ToolResult, ToolError> {
            let text = params.get("text").and_then(Value::as_str).unwrap_or("");
            Ok(ToolResult::success(text))
        }
    }

    #[tokio::test]
    async fn execute_validates_before_running() {
        let registry = ToolRegistry::builder().register(Echo).build();
        let err = registry.execute("echo", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::MissingField { .. }));

        let ok = registry
            .execute("echo", json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(ok.content, "hi");
    }

    #[tokio::test]
    async fn unknown_tool_is_not_available() {
        let registry = ToolRegistry::builder().build();
        let err = registry.execute("missing", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::NotAvailable { .. }));
    }

    #[test]
    fn names_preserve_registration_order() {
        let registry = ToolRegistry::builder().register(Echo).build();
        assert_eq!(registry.names().to_vec(), vec!["echo".to_string()]);
        assert!(registry.contains("echo"));
        assert_eq!(registry.len(), 1);
    }
}
