//! OpenAI chat-completions adapter.
//!
//! Also serves OpenAI-compatible endpoints (GLM, OpenRouter): the adapter is
//! instantiated with the provider name and base URL it speaks for. Tool
//! parameter schemas are stripped of the JSON-Schema keywords strict
//! back-ends reject.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::Provider;
use crate::protocol::{
    ChatOptions, FinishReason, LLMResponse, Message, Role, ToolCall, ToolDefinition, ToolFunction,
    Usage,
};

/// Schema keywords some OpenAI-compatible back-ends refuse.
const UNSUPPORTED_SCHEMA_KEYS: &[&str] = &["$schema", "$id", "$defs", "definitions"];

pub struct OpenAIProvider {
    name: String,
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAIProvider {
    pub fn new(name: &str, api_key: &str, base_url: &str) -> Self {
        Self {
            name: name.to_string(),
            client: Client::new(),
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

/// Recursively drop schema keywords strict back-ends reject.
fn sanitize_schema(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .iter()
                .filter(|(key, _)| !UNSUPPORTED_SCHEMA_KEYS.contains(&key.as_str()))
                .map(|(key, v)| (key.clone(), sanitize_schema(v)))
                .collect();
            Value::Object(cleaned)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize_schema).collect()),
        other => other.clone(),
    }
}

fn format_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": sanitize_schema(&t.parameters)
                }
            })
        })
        .collect()
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
                        let mut function = json!({
                            "name": call.name,
                            "arguments": call.arguments_json()
                        });
                        // Opaque reasoning signature: echoed back untouched for
                        // back-ends that require it.
                        if let Some(ref sig) = call.function.thought_signature {
                            function["thought_signature"] = json!(sig);
                        }
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": function
                        })
                    })
                    .collect::<Vec<_>>());
            }
            if let Some(ref id) = m.tool_call_id {
                msg["tool_call_id"] = json!(id);
            }
            msg
        })
        .collect()
}

fn parse_response(body: &Value, provider: &str) -> Result<LLMResponse> {
    if let Some(error) = body.get("error") {
        anyhow::bail!("{} API error: {}", provider, error);
    }

    let choice = body["choices"]
        .get(0)
        .ok_or_else(|| anyhow::anyhow!("No choices in {} response", provider))?;
    let message = &choice["message"];

    let mut tool_calls: Vec<ToolCall> = Vec::new();
    if let Some(calls) = message["tool_calls"].as_array() {
        for tc in calls {
            let mut call = ToolCall {
                id: tc["id"].as_str().unwrap_or("").to_string(),
                name: String::new(),
                arguments: Map::new(),
                function: ToolFunction {
                    name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
                    arguments: tc["function"]["arguments"]
                        .as_str()
                        .unwrap_or("{}")
                        .to_string(),
                    thought_signature: tc["function"]["thought_signature"]
                        .as_str()
                        .map(|s| s.to_string()),
                },
            };
            call.normalize();
            tool_calls.push(call);
        }
    }

    let finish_reason = match choice["finish_reason"].as_str() {
        _ if !tool_calls.is_empty() => FinishReason::ToolCalls,
        Some("length") => FinishReason::Length,
        _ => FinishReason::Stop,
    };

    let usage = body.get("usage").map(|u| Usage {
        input_tokens: u["prompt_tokens"].as_u64().unwrap_or(0),
        output_tokens: u["completion_tokens"].as_u64().unwrap_or(0),
    });

    Ok(LLMResponse {
        content: message["content"].as_str().unwrap_or("").to_string(),
        reasoning_content: message["reasoning_content"].as_str().map(|s| s.to_string()),
        tool_calls,
        finish_reason,
        usage,
    })
}

#[async_trait]
impl Provider for OpenAIProvider {
    fn name(&self) -> &str {
        &self.name
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
            "max_tokens": opts.max_tokens,
            "temperature": opts.temperature
        });
        if !tools.is_empty() {
            body["tools"] = json!(format_tools(tools));
        }

        debug!("{} request to model {}", self.name, model);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("{} API error {}: {}", self.name, status.as_u16(), text);
        }

        let response_body: Value = response.json().await?;
        parse_response(&response_body, &self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_assistant_tool_calls() {
        let mut args = Map::new();
        args.insert("x".to_string(), json!("hi"));

        let messages = vec![
            Message::user("run"),
            Message::assistant_with_tool_calls("", vec![ToolCall::new("c1", "echo", args)]),
            Message::tool("c1", "hi"),
        ];
        let formatted = format_messages(&messages);

        assert_eq!(formatted[1]["tool_calls"][0]["id"], "c1");
        assert_eq!(formatted[1]["tool_calls"][0]["function"]["name"], "echo");
        let wire_args = formatted[1]["tool_calls"][0]["function"]["arguments"]
            .as_str()
            .unwrap();
        let reparsed: Value = serde_json::from_str(wire_args).unwrap();
        assert_eq!(reparsed["x"], "hi");

        assert_eq!(formatted[2]["role"], "tool");
        assert_eq!(formatted[2]["tool_call_id"], "c1");
    }

    #[test]
    fn test_schema_sanitization_strips_unsupported_keys() {
        let schema = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "properties": {
                "x": {"type": "string", "$id": "#x"}
            },
            "definitions": {"y": {"type": "number"}}
        });
        let cleaned = sanitize_schema(&schema);
        assert!(cleaned.get("$schema").is_none());
        assert!(cleaned.get("definitions").is_none());
        assert!(cleaned["properties"]["x"].get("$id").is_none());
        assert_eq!(cleaned["properties"]["x"]["type"], "string");
    }

    #[test]
    fn test_parse_tool_call_response() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "c1",
                        "type": "function",
                        "function": {"name": "echo", "arguments": "{\"x\":\"hi\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 5, "completion_tokens": 7}
        });

        let response = parse_response(&body, "openai").unwrap();
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
        let call = &response.tool_calls[0];
        assert_eq!(call.name, "echo");
        assert_eq!(call.arguments["x"], json!("hi"));
        assert_eq!(response.usage.unwrap().output_tokens, 7);
    }

    #[test]
    fn test_parse_bad_arguments_fall_back_to_raw() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [{
                        "id": "c1",
                        "function": {"name": "echo", "arguments": "{{nope"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        });

        let response = parse_response(&body, "openai").unwrap();
        assert_eq!(response.tool_calls[0].arguments["raw"], json!("{{nope"));
    }

    #[test]
    fn test_thought_signature_round_trip() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [{
                        "id": "c1",
                        "function": {
                            "name": "echo",
                            "arguments": "{}",
                            "thought_signature": "sig-1"
                        }
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        });
        let response = parse_response(&body, "openai").unwrap();
        let call = response.tool_calls.into_iter().next().unwrap();
        assert_eq!(call.function.thought_signature.as_deref(), Some("sig-1"));

        // Echoed back when the assistant turn is re-sent
        let assistant = Message::assistant_with_tool_calls("", vec![call]);
        let formatted = format_messages(&[assistant]);
        assert_eq!(
            formatted[0]["tool_calls"][0]["function"]["thought_signature"],
            "sig-1"
        );
    }

    #[test]
    fn test_parse_length_finish() {
        let body = json!({
            "choices": [{
                "message": {"content": "partial"},
                "finish_reason": "length"
            }]
        });
        let response = parse_response(&body, "openai").unwrap();
        assert_eq!(response.finish_reason, FinishReason::Length);
    }
}
