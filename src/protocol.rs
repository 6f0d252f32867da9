//! Wire-neutral conversation types shared by every provider adapter.
//!
//! A [`ToolCall`] carries its arguments twice: as a parsed mapping (what the
//! scheduler and tools consume) and as the provider-wire JSON string inside
//! [`ToolFunction`]. [`ToolCall::normalize`] reconciles the two views so that
//! after normalization they always agree.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Provider-wire view of a tool call (function-calling envelope).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolFunction {
    #[serde(default)]
    pub name: String,

    /// JSON-encoded arguments exactly as received from (or sent to) the wire.
    #[serde(default)]
    pub arguments: String,

    /// Opaque reasoning signature some back-ends require to be echoed on the
    /// next call. Carried transparently, never interpreted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub arguments: Map<String, Value>,

    #[serde(default)]
    pub function: ToolFunction,
}

impl ToolCall {
    pub fn new(id: &str, name: &str, arguments: Map<String, Value>) -> Self {
        let mut call = Self {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
            function: ToolFunction::default(),
        };
        call.normalize();
        call
    }

    /// Reconcile the parsed and wire views of this call.
    ///
    /// Fills a missing `name` from the function view, parses
    /// `function.arguments` into the mapping when the mapping is empty
    /// (falling back to `{"raw": <string>}` on parse failure), then
    /// regenerates the JSON string from the mapping.
    pub fn normalize(&mut self) {
        if self.name.is_empty() {
            self.name = self.function.name.clone();
        }
        if self.arguments.is_empty() && !self.function.arguments.is_empty() {
            match serde_json::from_str::<Value>(&self.function.arguments) {
                Ok(Value::Object(map)) => self.arguments = map,
                _ => {
                    self.arguments.insert(
                        "raw".to_string(),
                        Value::String(self.function.arguments.clone()),
                    );
                }
            }
        }
        self.function.name = self.name.clone();
        self.function.arguments = Value::Object(self.arguments.clone()).to_string();
    }

    /// The wire-form JSON of the arguments (valid after `normalize`).
    pub fn arguments_json(&self) -> &str {
        &self.function.arguments
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,

    #[serde(default)]
    pub content: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn assistant_with_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    pub fn tool(tool_call_id: &str, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.to_string()),
            ..Self::plain(Role::Tool, content)
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            reasoning_content: None,
            thought_signature: None,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// A tool surface advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON-schema-shaped parameter object.
    pub parameters: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
}

/// Token usage reported by a provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// A single model response, already translated out of the provider wire form.
#[derive(Debug, Clone)]
pub struct LLMResponse {
    pub content: String,
    pub reasoning_content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    pub usage: Option<Usage>,
}

impl LLMResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            reasoning_content: None,
            tool_calls: Vec::new(),
            finish_reason: FinishReason::Stop,
            usage: None,
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            content: String::new(),
            reasoning_content: None,
            tool_calls: calls,
            finish_reason: FinishReason::ToolCalls,
            usage: None,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Per-call options every adapter understands; unknown concerns are the
/// adapter's own business.
#[derive(Debug, Clone, Copy)]
pub struct ChatOptions {
    pub max_tokens: usize,
    pub temperature: f32,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            max_tokens: 8192,
            temperature: 0.7,
        }
    }
}
