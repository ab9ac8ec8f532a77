//! Tool contract and registry.
//!
//! Tools are the agent's side-effecting capabilities: named, schema-described
//! and dispatched uniformly by the coordinator. Implementations live outside
//! this crate; what lives here is the narrow contract they conform to and the
//! name-indexed registry the coordinator resolves against.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use thiserror::Error;

use super::catalog::ToolSpec;

/// Errors a tool execution can surface.
///
/// None of these are fatal to the agent loop: the coordinator converts them
/// into error [`ToolOutput`]s that flow back into the conversation.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

/// What a tool execution produced: plain text, flagged as success or error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    /// The textual output fed back to the model.
    pub content: String,
    /// Whether the execution ended in an error.
    pub is_error: bool,
}

impl ToolOutput {
    /// Creates a successful output.
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    /// Creates an error output.
    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// A capability the model can invoke.
///
/// `execute` may suspend. It must not panic on bad input: invalid arguments
/// are reported through [`ToolError::InvalidArguments`].
#[async_trait]
pub trait Tool: Send + Sync {
    /// Stable identifier; the registry keys on it.
    fn name(&self) -> &str;

    /// Free text included in the system prompt's tool catalog.
    fn description(&self) -> &str;

    /// JSON-schema-shaped parameter description:
    /// `{"type":"object","properties":{...},"required":[...]}`.
    fn parameters_schema(&self) -> Value;

    /// Runs the tool against a parsed argument object.
    async fn execute(&self, args: Map<String, Value>) -> Result<ToolOutput, ToolError>;
}

type Handler =
    Box<dyn Fn(Map<String, Value>) -> BoxFuture<'static, Result<ToolOutput, ToolError>> + Send + Sync>;

/// Adapter binding a [`ToolSpec`] descriptor to an async closure.
///
/// This is how hosts wire the default catalog entries (and anything else) to
/// their real implementations without writing a struct per tool.
pub struct FunctionTool {
    spec: ToolSpec,
    handler: Handler,
}

impl FunctionTool {
    pub fn new<F, Fut>(spec: ToolSpec, handler: F) -> Self
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<ToolOutput, ToolError>> + Send + 'static,
    {
        Self {
            spec,
            handler: Box::new(move |args| Box::pin(handler(args))),
        }
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn description(&self) -> &str {
        &self.spec.description
    }

    fn parameters_schema(&self) -> Value {
        self.spec.parameters.clone()
    }

    async fn execute(&self, args: Map<String, Value>) -> Result<ToolOutput, ToolError> {
        (self.handler)(args).await
    }
}

/// Name-indexed collection of tools, safe under concurrent access from
/// multiple coordinators.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool under its own name. Duplicate registration replaces.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        let replaced = self
            .tools
            .write()
            .expect("tool registry poisoned")
            .insert(name.clone(), tool)
            .is_some();
        if replaced {
            tracing::debug!("tool '{name}' re-registered");
        }
    }

    /// Removes a tool by name, returning it if present.
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .write()
            .expect("tool registry poisoned")
            .remove(name)
    }

    /// Looks up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .expect("tool registry poisoned")
            .get(name)
            .cloned()
    }

    /// Registered tool names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .read()
            .expect("tool registry poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// All registered tools, sorted by name for deterministic prompts.
    pub fn snapshot(&self) -> Vec<Arc<dyn Tool>> {
        let mut tools: Vec<Arc<dyn Tool>> = self
            .tools
            .read()
            .expect("tool registry poisoned")
            .values()
            .cloned()
            .collect();
        tools.sort_by(|a, b| a.name().cmp(b.name()));
        tools
    }

    pub fn len(&self) -> usize {
        self.tools.read().expect("tool registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispatches by name. Unknown names fail with [`ToolError::NotFound`];
    /// everything else delegates to the tool.
    ///
    /// The registry lock is released before the execution suspends.
    pub async fn execute_by_name(
        &self,
        name: &str,
        args: Map<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        tool.execute(args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_tool(name: &str) -> Arc<dyn Tool> {
        let spec = ToolSpec {
            name: name.to_string(),
            description: "Echoes its input back.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string", "description": "Text to echo" }
                },
                "required": ["text"]
            }),
        };
        Arc::new(FunctionTool::new(spec, |args| async move {
            match args.get("text").and_then(Value::as_str) {
                Some(text) => Ok(ToolOutput::success(text.to_string())),
                None => Err(ToolError::InvalidArguments("missing 'text'".into())),
            }
        }))
    }

    #[tokio::test]
    async fn test_execute_by_name_dispatches() {
        let registry = ToolRegistry::new();
        registry.register(echo_tool("echo"));

        let mut args = Map::new();
        args.insert("text".into(), json!("hello"));
        let output = registry.execute_by_name("echo", args).await.unwrap();
        assert_eq!(output.content, "hello");
        assert!(!output.is_error);
    }

    #[tokio::test]
    async fn test_unknown_tool_fails_with_not_found() {
        let registry = ToolRegistry::new();
        let err = registry
            .execute_by_name("nonexistent", Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
        assert_eq!(err.to_string(), "Tool not found: nonexistent");
    }

    #[tokio::test]
    async fn test_invalid_arguments_reported_not_panicked() {
        let registry = ToolRegistry::new();
        registry.register(echo_tool("echo"));
        let err = registry
            .execute_by_name("echo", Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[test]
    fn test_register_unregister_round_trip() {
        let registry = ToolRegistry::new();
        assert!(registry.is_empty());

        registry.register(echo_tool("echo"));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("echo").is_some());

        registry.unregister("echo");
        assert!(registry.is_empty());
        assert!(registry.get("echo").is_none());
    }

    #[test]
    fn test_duplicate_registration_replaces() {
        let registry = ToolRegistry::new();
        registry.register(echo_tool("echo"));
        registry.register(echo_tool("echo"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_names_sorted() {
        let registry = ToolRegistry::new();
        registry.register(echo_tool("zulu"));
        registry.register(echo_tool("alpha"));
        registry.register(echo_tool("mike"));
        assert_eq!(registry.names(), vec!["alpha", "mike", "zulu"]);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].name(), "alpha");
        assert_eq!(snapshot[2].name(), "zulu");
    }

    #[test]
    fn test_registry_shared_across_threads() {
        let registry = Arc::new(ToolRegistry::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry.register(echo_tool(&format!("tool-{i}")));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.len(), 4);
    }
}
