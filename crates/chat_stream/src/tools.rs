//! Caller-supplied tool executors.

use crate::types::{FunctionTool, Tool};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Executes one tool call. Implementations may be slow or have side effects;
/// the dispatch loop awaits each call before starting the next.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Runs the tool with its parsed arguments and returns the content of
    /// the tool message. An error is reported back to the model.
    async fn execute(&self, arguments: Map<String, Value>) -> Result<String>;
}

/// Adapts a synchronous closure into a [`ToolExecutor`].
pub struct FnTool<F> {
    function: F,
}

impl<F> FnTool<F>
where
    F: Fn(Map<String, Value>) -> Result<String> + Send + Sync,
{
    pub fn new(function: F) -> Self {
        Self { function }
    }
}

#[async_trait]
impl<F> ToolExecutor for FnTool<F>
where
    F: Fn(Map<String, Value>) -> Result<String> + Send + Sync,
{
    async fn execute(&self, arguments: Map<String, Value>) -> Result<String> {
        (self.function)(arguments)
    }
}

/// Maps tool names to executors, and optionally to the declarations that
/// are sent with each request.
#[derive(Default)]
pub struct ToolRegistry {
    executors: HashMap<String, Box<dyn ToolExecutor>>,
    definitions: Vec<FunctionTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor under `name` without declaring it to the model.
    pub fn register(&mut self, name: impl Into<String>, executor: Box<dyn ToolExecutor>) {
        self.executors.insert(name.into(), executor);
    }

    pub fn register_fn<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(Map<String, Value>) -> Result<String> + Send + Sync + 'static,
    {
        self.register(name, Box::new(FnTool::new(function)));
    }

    /// Register an executor together with its declaration.
    pub fn register_tool(&mut self, definition: FunctionTool, executor: Box<dyn ToolExecutor>) {
        self.definitions.retain(|existing| existing.name != definition.name);
        self.register(definition.name.clone(), executor);
        self.definitions.push(definition);
    }

    pub fn get(&self, name: &str) -> Option<&dyn ToolExecutor> {
        self.executors.get(name).map(|executor| executor.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    /// Declarations registered through [`register_tool`](Self::register_tool),
    /// in registration order.
    pub fn tools(&self) -> Vec<Tool> {
        self.definitions
            .iter()
            .cloned()
            .map(FunctionTool::into_tool)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn arguments(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[tokio::test]
    async fn test_register_and_execute() {
        let mut registry = ToolRegistry::new();
        registry.register_fn("echo", |args| {
            let text = args
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow::anyhow!("text is required"))?;
            Ok(text.to_uppercase())
        });

        assert!(registry.contains("echo"));
        assert!(!registry.contains("missing"));
        assert!(registry.tools().is_empty());

        let executor = registry.get("echo").unwrap();
        let output = executor.execute(arguments(json!({"text": "hi"}))).await.unwrap();
        assert_eq!(output, "HI");

        let error = executor.execute(Map::new()).await.unwrap_err();
        assert_eq!(error.to_string(), "text is required");
    }

    #[test]
    fn test_register_tool_declares_it_once() {
        let mut registry = ToolRegistry::new();
        let definition = FunctionTool::new("now", "Current time");
        registry.register_tool(
            definition.clone(),
            Box::new(FnTool::new(|_| Ok("12:00".to_string()))),
        );
        registry.register_tool(
            definition,
            Box::new(FnTool::new(|_| Ok("13:00".to_string()))),
        );

        let tools = registry.tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].function.name, "now");
        assert!(registry.contains("now"));
    }
}
