//! Ollama `/api/chat` adapter (non-streaming).
//!
//! Ollama emits tool-call arguments as objects and assigns no call ids, so
//! ids are synthesized here to keep the tool-result linkage intact.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use super::Provider;
use crate::protocol::{
    ChatOptions, FinishReason, LLMResponse, Message, Role, ToolCall, ToolDefinition,
};

pub struct OllamaProvider {
    client: Client,
    endpoint: String,
}

impl OllamaProvider {
    pub fn new(endpoint: &str) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }
}

fn format_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            let mut msg = json!({"role": role, "content": m.content});
            if m.has_tool_calls() {
                msg["tool_calls"] = json!(m
                    .tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "function": {
                                "name": call.name,
                                "arguments": Value::Object(call.arguments.clone())
                            }
                        })
                    })
                    .collect::<Vec<_>>());
            }
            msg
        })
        .collect()
}

fn parse_response(body: &Value) -> Result<LLMResponse> {
    if let Some(error) = body.get("error") {
        anyhow::bail!("Ollama API error: {}", error);
    }

    let message = body
        .get("message")
        .ok_or_else(|| anyhow::anyhow!("No message in Ollama response"))?;

    let mut tool_calls: Vec<ToolCall> = Vec::new();
    if let Some(calls) = message["tool_calls"].as_array() {
        for tc in calls {
            let arguments = tc["function"]["arguments"]
                .as_object()
                .cloned()
                .unwrap_or_default();
            let id = format!("call_{}", uuid::Uuid::new_v4().as_simple());
            tool_calls.push(ToolCall::new(
                &id,
                tc["function"]["name"].as_str().unwrap_or(""),
                arguments,
            ));
        }
    }

    let finish_reason = match body["done_reason"].as_str() {
        _ if !tool_calls.is_empty() => FinishReason::ToolCalls,
        Some("length") => FinishReason::Length,
        _ => FinishReason::Stop,
    };

    Ok(LLMResponse {
        content: message["content"].as_str().unwrap_or("").to_string(),
        reasoning_content: None,
        tool_calls,
        finish_reason,
        usage: None,
    })
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        model: &str,
        opts: &ChatOptions,
    ) -> Result<LLMResponse> {
        let mut body = json!({
            "model": model,
            "messages": format_messages(messages),
            "stream": false,
            "options": {
                "num_predict": opts.max_tokens,
                "temperature": opts.temperature
            }
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters
                        }
                    })
                })
                .collect::<Vec<_>>());
        }

        debug!("Ollama request to model {}", model);

        let response = self
            .client
            .post(format!("{}/api/chat", self.endpoint))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama API error {}: {}", status.as_u16(), text);
        }

        let response_body: Value = response.json().await?;
        parse_response(&response_body)
    }
}
