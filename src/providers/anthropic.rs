//! Anthropic messages-API adapter.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use super::Provider;
use crate::protocol::{
    ChatOptions, FinishReason, LLMResponse, Message, Role, ToolCall, ToolDefinition, Usage,
};

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: &str, base_url: &str) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

/// Split the protocol messages into the system string and the wire list.
/// System turns are merged into one string; the messages API takes the
/// system prompt out-of-band.
fn format_messages(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system_parts: Vec<&str> = Vec::new();
    let mut formatted = Vec::new();

    for m in messages {
        match m.role {
            Role::System => system_parts.push(&m.content),
            Role::User => {
                formatted.push(json!({"role": "user", "content": m.content}));
            }
            Role::Assistant => {
                if m.has_tool_calls() {
                    let mut blocks: Vec<Value> = Vec::new();
                    if !m.content.is_empty() {
                        blocks.push(json!({"type": "text", "text": m.content}));
                    }
                    for call in &m.tool_calls {
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.name,
                            "input": Value::Object(call.arguments.clone())
                        }));
                    }
                    formatted.push(json!({"role": "assistant", "content": blocks}));
                } else {
                    formatted.push(json!({"role": "assistant", "content": m.content}));
                }
            }
            Role::Tool => {
                if let Some(ref id) = m.tool_call_id {
                    formatted.push(json!({
                        "role": "user",
                        "content": [{
                            "type": "tool_result",
                            "tool_use_id": id,
                            "content": m.content
                        }]
                    }));
                }
            }
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system, formatted)
}

fn format_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.parameters
            })
        })
        .collect()
}

fn parse_response(body: &Value) -> Result<LLMResponse> {
    if let Some(error) = body.get("error") {
        anyhow::bail!("Anthropic API error: {}", error);
    }

    let blocks = body["content"]
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("No content in Anthropic response"))?;

    let mut content = String::new();
    let mut reasoning: Option<String> = None;
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for block in blocks {
        match block["type"].as_str() {
            Some("text") => content.push_str(block["text"].as_str().unwrap_or("")),
            Some("thinking") => {
                reasoning = block["thinking"].as_str().map(|s| s.to_string());
            }
            Some("tool_use") => {
                let arguments = block["input"]
                    .as_object()
                    .cloned()
                    .unwrap_or_default();
                let mut call = ToolCall::new(
                    block["id"].as_str().unwrap_or(""),
                    block["name"].as_str().unwrap_or(""),
                    arguments,
                );
                call.normalize();
                tool_calls.push(call);
            }
            _ => {}
        }
    }

    let finish_reason = match body["stop_reason"].as_str() {
        _ if !tool_calls.is_empty() => FinishReason::ToolCalls,
        Some("max_tokens") => FinishReason::Length,
        _ => FinishReason::Stop,
    };

    let usage = body.get("usage").map(|u| Usage {
        input_tokens: u["input_tokens"].as_u64().unwrap_or(0),
        output_tokens: u["output_tokens"].as_u64().unwrap_or(0),
    });

    Ok(LLMResponse {
        content,
        reasoning_content: reasoning,
        tool_calls,
        finish_reason,
        usage,
    })
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        model: &str,
        opts: &ChatOptions,
    ) -> Result<LLMResponse> {
        let (system, formatted) = format_messages(messages);

        let mut body = json!({
            "model": model,
            "max_tokens": opts.max_tokens,
            "temperature": opts.temperature,
            "messages": formatted
        });
        if let Some(system) = system {
            body["system"] = json!(system);
        }
        if !tools.is_empty() {
            body["tools"] = json!(format_tools(tools));
        }

        debug!("Anthropic request to model {}", model);

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Anthropic API error {}: {}", status.as_u16(), text);
        }

        let response_body: Value = response.json().await?;
        parse_response(&response_body)
    }
}
