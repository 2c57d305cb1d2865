//! Tool trait pair and the name-keyed registry.

use crate::llm::ToolSpec;
use std::pin::Pin;
use std::sync::Arc;

/// A tool invocation failure. Never fatal to a batch: the message is handed
/// back to the LLM as the tool's output.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ToolFailure(pub String);

impl ToolFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Static trait for tools.
pub trait Tool: Send + Sync + 'static {
    /// Unique name the LLM calls this tool by.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the arguments object.
    fn parameters(&self) -> serde_json::Value;

    /// Execute with parsed arguments.
    fn call(
        &self,
        args: serde_json::Value,
    ) -> impl std::future::Future<Output = std::result::Result<String, ToolFailure>> + Send;
}

/// Dynamic trait for runtime polymorphism.
pub trait ToolDyn: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters(&self) -> serde_json::Value;

    fn call<'a>(
        &'a self,
        args: serde_json::Value,
    ) -> Pin<Box<dyn std::future::Future<Output = std::result::Result<String, ToolFailure>> + Send + 'a>>;
}

/// Blanket implementation: any `Tool` is a `ToolDyn`.
impl<T: Tool> ToolDyn for T {
    fn name(&self) -> &str {
        Tool::name(self)
    }

    fn description(&self) -> &str {
        Tool::description(self)
    }

    fn parameters(&self) -> serde_json::Value {
        Tool::parameters(self)
    }

    fn call<'a>(
        &'a self,
        args: serde_json::Value,
    ) -> Pin<Box<dyn std::future::Future<Output = std::result::Result<String, ToolFailure>> + Send + 'a>>
    {
        Box::pin(Tool::call(self, args))
    }
}

/// Shared tool handle.
pub type SharedTool = Arc<dyn ToolDyn>;

/// Name-keyed tool collection. Registration order is exposure order; on a
/// name collision the first definition wins and the duplicate is dropped
/// with a warning.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<SharedTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: SharedTool) {
        if self.get(tool.name()).is_some() {
            tracing::warn!(tool = %tool.name(), "duplicate tool name, first definition wins");
            return;
        }
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<&SharedTool> {
        self.tools.iter().find(|tool| tool.name() == name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SharedTool> {
        self.tools.iter()
    }

    /// Specs for the LLM, in registration order.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect()
    }

    /// Dispatch a call by name with raw (possibly malformed) JSON arguments.
    pub async fn call(&self, name: &str, raw_args: &str) -> std::result::Result<String, ToolFailure> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolFailure::new(format!("unknown tool: {name}")))?;

        let args: serde_json::Value = if raw_args.trim().is_empty() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str(raw_args)
                .map_err(|error| ToolFailure::new(format!("malformed tool arguments: {error}")))?
        };

        tool.call(args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool {
        name: &'static str,
    }

    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "echoes its input"
        }

        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {"value": {"type": "string"}}})
        }

        async fn call(&self, args: serde_json::Value) -> std::result::Result<String, ToolFailure> {
            Ok(format!(
                "{}:{}",
                self.name,
                args.get("value").and_then(|v| v.as_str()).unwrap_or("")
            ))
        }
    }

    #[tokio::test]
    async fn dispatches_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool { name: "echo" }));

        let result = registry
            .call("echo", r#"{"value": "hi"}"#)
            .await
            .expect("call");
        assert_eq!(result, "echo:hi");
    }

    #[tokio::test]
    async fn first_registration_wins_on_collision() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool { name: "echo" }));
        registry.register(Arc::new(EchoTool { name: "echo" }));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.specs().len(), 1);
    }

    #[tokio::test]
    async fn malformed_arguments_are_tool_failures() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool { name: "echo" }));

        let error = registry.call("echo", "{not json").await.expect_err("fail");
        assert!(error.0.contains("malformed tool arguments"));

        let unknown = registry.call("nope", "{}").await.expect_err("fail");
        assert!(unknown.0.contains("unknown tool"));
    }

    #[tokio::test]
    async fn empty_arguments_default_to_object() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool { name: "echo" }));
        let result = registry.call("echo", "").await.expect("call");
        assert_eq!(result, "echo:");
    }
}
