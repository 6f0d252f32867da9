//! Tool surface: the trait, capability probes, and the registry.
//!
//! Tools are plain async callables with a JSON-schema parameter surface.
//! Optional capabilities (context, async completion, progress updates) are
//! discovered at dispatch time through probe methods; a tool that does not
//! advertise a capability behaves as if the callback was never injected.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{info, warn};

use super::memory::MemoryStore;
use crate::protocol::ToolDefinition;

/// Invoked when an async tool's background work completes.
pub type AsyncCallback = Arc<dyn Fn(ToolResult) + Send + Sync>;

/// Invoked with human-readable status text during long tool runs.
pub type ProgressCallback = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct ToolResult {
    /// Appended to the conversation as the tool-role message.
    pub for_llm: String,

    /// What the outbound transport receives when non-silent and non-empty.
    pub for_user: String,

    pub silent: bool,

    pub is_error: bool,

    /// True when the tool only started background work; the real outcome
    /// arrives later through the completion callback.
    pub is_async: bool,

    pub err: Option<String>,
}

impl ToolResult {
    pub fn ok(for_llm: impl Into<String>) -> Self {
        Self {
            for_llm: for_llm.into(),
            ..Default::default()
        }
    }

    pub fn silent(for_llm: impl Into<String>) -> Self {
        Self {
            for_llm: for_llm.into(),
            silent: true,
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            for_llm: message.clone(),
            is_error: true,
            err: Some(message),
            ..Default::default()
        }
    }

    pub fn async_started(ack: impl Into<String>) -> Self {
        Self {
            for_llm: ack.into(),
            silent: true,
            is_async: true,
            ..Default::default()
        }
    }
}

/// Session coordinates handed to contextual tools before execution.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub channel: String,
    pub chat_id: String,
    pub session_key: String,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON-schema-shaped parameter object.
    fn parameters(&self) -> Value;

    async fn execute(&self, args: &Map<String, Value>) -> Result<ToolResult>;

    /// Capability probe: tools that need `(channel, chat_id, session_key)`.
    fn as_contextual(&self) -> Option<&dyn ContextualTool> {
        None
    }

    /// Capability probe: tools that run background work and report later.
    fn as_async(&self) -> Option<&dyn AsyncTool> {
        None
    }

    /// Capability probe: tools that emit progress updates.
    fn as_progress(&self) -> Option<&dyn ProgressTool> {
        None
    }
}

pub trait ContextualTool: Send + Sync {
    fn set_context(&self, ctx: &ToolContext);
}

pub trait AsyncTool: Send + Sync {
    fn set_completion_callback(&self, cb: AsyncCallback);
}

pub trait ProgressTool: Send + Sync {
    fn set_progress_callback(&self, cb: ProgressCallback);
}

/// Name→tool map with O(1) dispatch. Writes happen only at startup.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    order: RwLock<Vec<String>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        let mut tools = self.tools.write().expect("tool registry lock poisoned");
        let mut order = self.order.write().expect("tool registry lock poisoned");
        if tools.insert(name.clone(), tool).is_none() {
            order.push(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .expect("tool registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn list(&self) -> Vec<String> {
        self.order
            .read()
            .expect("tool registry lock poisoned")
            .clone()
    }

    /// Definitions in registration order, for the provider request.
    pub fn to_provider_definitions(&self) -> Vec<ToolDefinition> {
        self.list()
            .iter()
            .filter_map(|name| self.get(name))
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect()
    }

    /// One line per tool for the system prompt.
    pub fn summaries(&self) -> Vec<String> {
        self.list()
            .iter()
            .filter_map(|name| self.get(name))
            .map(|tool| format!("- {}: {}", tool.name(), tool.description()))
            .collect()
    }

    /// Dispatch a call: inject advertised capabilities, execute, and convert
    /// any error into a tool-result the loop can carry forward.
    pub async fn execute_with_context(
        &self,
        name: &str,
        args: &Map<String, Value>,
        ctx: &ToolContext,
        async_cb: Option<AsyncCallback>,
        progress_cb: Option<ProgressCallback>,
    ) -> ToolResult {
        let Some(tool) = self.get(name) else {
            warn!("Unknown tool requested: {}", name);
            return ToolResult::error(format!("Unknown tool: {}", name));
        };

        if let Some(contextual) = tool.as_contextual() {
            contextual.set_context(ctx);
        }
        if let (Some(async_tool), Some(cb)) = (tool.as_async(), async_cb) {
            async_tool.set_completion_callback(cb);
        }
        if let (Some(progress_tool), Some(cb)) = (tool.as_progress(), progress_cb) {
            progress_tool.set_progress_callback(cb);
        }

        let start = Instant::now();
        let result = match tool.execute(args).await {
            Ok(result) => result,
            Err(e) => ToolResult::error(format!("{:#}", e)),
        };

        info!(
            "Tool {} finished in {:?} (error: {}, async: {}, {} chars)",
            name,
            start.elapsed(),
            result.is_error,
            result.is_async,
            result.for_llm.len()
        );
        result
    }
}

fn required_str<'a>(args: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("Missing required argument: {}", key))
}

// Memory tools: the in-tree tool set backed by the workspace memory store.

pub struct MemoryRememberTool {
    memory: Arc<MemoryStore>,
}

impl MemoryRememberTool {
    pub fn new(memory: Arc<MemoryStore>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for MemoryRememberTool {
    fn name(&self) -> &str {
        "memory_remember"
    }

    fn description(&self) -> &str {
        "Store a durable fact in the long-term profile (key-value)"
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "key": {
                    "type": "string",
                    "description": "Short dotted key, e.g. user.timezone"
                },
                "value": {
                    "type": "string",
                    "description": "The fact to remember"
                }
            },
            "required": ["key", "value"]
        })
    }

    async fn execute(&self, args: &Map<String, Value>) -> Result<ToolResult> {
        let key = required_str(args, "key")?;
        let value = required_str(args, "value")?;
        self.memory.write_profile_key(key, value)?;
        Ok(ToolResult::silent(format!("Stored {}.", key)))
    }
}

pub struct MemoryForgetTool {
    memory: Arc<MemoryStore>,
}

impl MemoryForgetTool {
    pub fn new(memory: Arc<MemoryStore>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for MemoryForgetTool {
    fn name(&self) -> &str {
        "memory_forget"
    }

    fn description(&self) -> &str {
        "Delete a fact from the long-term profile"
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "key": {
                    "type": "string",
                    "description": "The profile key to delete"
                }
            },
            "required": ["key"]
        })
    }

    async fn execute(&self, args: &Map<String, Value>) -> Result<ToolResult> {
        let key = required_str(args, "key")?;
        self.memory.delete_profile_key(key)?;
        Ok(ToolResult::silent(format!("Forgot {}.", key)))
    }
}

pub struct MemoryNoteTool {
    memory: Arc<MemoryStore>,
}

impl MemoryNoteTool {
    pub fn new(memory: Arc<MemoryStore>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for MemoryNoteTool {
    fn name(&self) -> &str {
        "memory_note"
    }

    fn description(&self) -> &str {
        "Append a note to today's daily log"
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": {
                    "type": "string",
                    "description": "The note to append"
                }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, args: &Map<String, Value>) -> Result<ToolResult> {
        let text = required_str(args, "text")?;
        self.memory.append_today(text)?;
        Ok(ToolResult::silent("Noted."))
    }
}

/// Register the built-in memory tools for one agent workspace.
pub fn register_memory_tools(registry: &ToolRegistry, memory: Arc<MemoryStore>) {
    registry.register(Arc::new(MemoryRememberTool::new(Arc::clone(&memory))));
    registry.register(Arc::new(MemoryForgetTool::new(Arc::clone(&memory))));
    registry.register(Arc::new(MemoryNoteTool::new(memory)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn args(pairs: &[(&str, &str)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the input back"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {"x": {"type": "string"}}})
        }
        async fn execute(&self, args: &Map<String, Value>) -> Result<ToolResult> {
            Ok(ToolResult::ok(required_str(args, "x")?))
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "broken"
        }
        fn description(&self) -> &str {
            "Always fails"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _args: &Map<String, Value>) -> Result<ToolResult> {
            anyhow::bail!("it broke")
        }
    }

    #[derive(Default)]
    struct ContextSpyTool {
        seen: Mutex<Option<ToolContext>>,
    }

    #[async_trait]
    impl Tool for ContextSpyTool {
        fn name(&self) -> &str {
            "spy"
        }
        fn description(&self) -> &str {
            "Records its context"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _args: &Map<String, Value>) -> Result<ToolResult> {
            let seen = self.seen.lock().unwrap();
            Ok(ToolResult::ok(
                seen.as_ref()
                    .map(|c| c.session_key.clone())
                    .unwrap_or_default(),
            ))
        }
        fn as_contextual(&self) -> Option<&dyn ContextualTool> {
            Some(self)
        }
    }

    impl ContextualTool for ContextSpyTool {
        fn set_context(&self, ctx: &ToolContext) {
            *self.seen.lock().unwrap() = Some(ctx.clone());
        }
    }

    #[tokio::test]
    async fn test_dispatch_by_name() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        let result = registry
            .execute_with_context(
                "echo",
                &args(&[("x", "hi")]),
                &ToolContext::default(),
                None,
                None,
            )
            .await;
        assert_eq!(result.for_llm, "hi");
        assert!(!result.is_error);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_error_result() {
        let registry = ToolRegistry::new();
        let result = registry
            .execute_with_context("nope", &Map::new(), &ToolContext::default(), None, None)
            .await;
        assert!(result.is_error);
        assert!(result.for_llm.contains("Unknown tool"));
    }

    #[tokio::test]
    async fn test_tool_error_becomes_result() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(FailingTool));

        let result = registry
            .execute_with_context("broken", &Map::new(), &ToolContext::default(), None, None)
            .await;
        assert!(result.is_error);
        assert!(result.for_llm.contains("it broke"));
    }

    #[tokio::test]
    async fn test_context_injection_probe() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(ContextSpyTool::default()));

        let ctx = ToolContext {
            channel: "discord".to_string(),
            chat_id: "c9".to_string(),
            session_key: "agent:main:discord:dm:u1".to_string(),
        };
        let result = registry
            .execute_with_context("spy", &Map::new(), &ctx, None, None)
            .await;
        assert_eq!(result.for_llm, "agent:main:discord:dm:u1");
    }

    #[test]
    fn test_definitions_keep_registration_order() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(FailingTool));

        let defs = registry.to_provider_definitions();
        let names: Vec<_> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "broken"]);

        let summaries = registry.summaries();
        assert_eq!(summaries[0], "- echo: Echo the input back");
    }

    #[tokio::test]
    async fn test_memory_tools_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let memory = Arc::new(MemoryStore::new(tmp.path().to_path_buf()));
        let registry = ToolRegistry::new();
        register_memory_tools(&registry, Arc::clone(&memory));

        let result = registry
            .execute_with_context(
                "memory_remember",
                &args(&[("key", "user.name"), ("value", "Ada")]),
                &ToolContext::default(),
                None,
                None,
            )
            .await;
        assert!(!result.is_error);
        assert!(result.silent);
        assert_eq!(
            memory.read_profile().get("user.name").map(String::as_str),
            Some("Ada")
        );

        registry
            .execute_with_context(
                "memory_forget",
                &args(&[("key", "user.name")]),
                &ToolContext::default(),
                None,
                None,
            )
            .await;
        assert!(memory.read_profile().is_empty());
    }
}
