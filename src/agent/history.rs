//! History sanitization and token estimation.
//!
//! Providers reject conversations whose tool-call bookkeeping is broken: a
//! tool result without its call, an assistant tool-call turn with results
//! missing. [`sanitize`] repairs a history into a provider-valid sequence in
//! two deterministic passes and is idempotent; it never mutates the stored
//! session, callers get a cleaned copy.

use std::collections::HashSet;
use tracing::debug;

use crate::protocol::{Message, Role, ToolCall};

/// Estimated tokens for a whole history: `ceil(chars * 2 / 5)`, counting
/// message content plus each tool call's name and argument JSON.
pub fn estimate_history_tokens(messages: &[Message]) -> usize {
    let chars: usize = messages.iter().map(message_chars).sum();
    chars_to_tokens(chars)
}

/// Estimated tokens for a single turn, same ratio.
pub fn estimate_message_tokens(message: &Message) -> usize {
    chars_to_tokens(message_chars(message))
}

fn message_chars(message: &Message) -> usize {
    let mut chars = message.content.chars().count();
    for call in &message.tool_calls {
        chars += call.name.chars().count();
        chars += call.arguments_json().chars().count();
    }
    chars
}

fn chars_to_tokens(chars: usize) -> usize {
    (chars * 2).div_ceil(5)
}

/// Produce a provider-valid copy of `history`.
pub fn sanitize(history: &[Message]) -> Vec<Message> {
    drop_partial_turns(drop_orphans(history))
}

/// Pass 1: drop messages with no valid anchor.
///
/// - tool messages whose backward walk (across tool messages only) does not
///   reach an assistant turn carrying the matching tool-call id;
/// - assistant tool-call turns with no predecessor;
/// - assistant tool-call turns whose predecessor is neither user nor tool.
fn drop_orphans(history: &[Message]) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(history.len());

    for msg in history {
        match msg.role {
            Role::Tool => {
                if tool_is_anchored(&out, msg.tool_call_id.as_deref()) {
                    out.push(msg.clone());
                } else {
                    debug!(
                        "Dropping orphan tool message (tool_call_id: {:?})",
                        msg.tool_call_id
                    );
                }
            }
            Role::Assistant if msg.has_tool_calls() => match out.last() {
                Some(prev) if matches!(prev.role, Role::User | Role::Tool) => {
                    out.push(msg.clone());
                }
                Some(prev) => {
                    debug!(
                        "Dropping assistant tool-call turn after {:?} turn",
                        prev.role
                    );
                }
                None => {
                    debug!("Dropping leading assistant tool-call turn");
                }
            },
            _ => out.push(msg.clone()),
        }
    }

    out
}

/// Walk backward over the already-kept messages, skipping tool messages,
/// until the nearest non-tool turn. The walk anchors only on an assistant
/// turn whose tool calls include `id`.
fn tool_is_anchored(kept: &[Message], id: Option<&str>) -> bool {
    let Some(id) = id else { return false };

    for prev in kept.iter().rev() {
        match prev.role {
            Role::Tool => continue,
            Role::Assistant if prev.has_tool_calls() => {
                return prev.tool_calls.iter().any(|c| c.id == id);
            }
            _ => return false,
        }
    }
    false
}

/// Pass 2: for every assistant tool-call turn, the contiguous tool messages
/// that follow must be a bijection with its tool-call ids; otherwise the
/// whole partial turn (assistant plus its tool messages) is dropped.
fn drop_partial_turns(msgs: Vec<Message>) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(msgs.len());
    let mut i = 0;

    while i < msgs.len() {
        let msg = &msgs[i];
        if msg.role == Role::Assistant && msg.has_tool_calls() {
            let mut j = i + 1;
            while j < msgs.len() && msgs[j].role == Role::Tool {
                j += 1;
            }
            if block_matches(&msg.tool_calls, &msgs[i + 1..j]) {
                out.extend_from_slice(&msgs[i..j]);
            } else {
                debug!(
                    "Dropping partial tool turn ({} calls, {} results)",
                    msg.tool_calls.len(),
                    j - i - 1
                );
            }
            i = j;
        } else {
            out.push(msg.clone());
            i += 1;
        }
    }

    out
}

fn block_matches(calls: &[ToolCall], block: &[Message]) -> bool {
    if calls.len() != block.len() {
        return false;
    }
    let mut expected: HashSet<&str> = calls.iter().map(|c| c.id.as_str()).collect();
    if expected.len() != calls.len() {
        // Duplicate call ids cannot be paired one-to-one
        return false;
    }
    for msg in block {
        match msg.tool_call_id.as_deref() {
            Some(id) if expected.remove(id) => {}
            _ => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(id: &str) -> ToolCall {
        let mut args = serde_json::Map::new();
        args.insert("x".to_string(), json!("y"));
        ToolCall::new(id, "echo", args)
    }

    fn valid_history() -> Vec<Message> {
        vec![
            Message::user("run it"),
            Message::assistant_with_tool_calls("", vec![call("c1"), call("c2")]),
            Message::tool("c1", "ok1"),
            Message::tool("c2", "ok2"),
            Message::assistant("done"),
        ]
    }

    #[test]
    fn test_valid_history_unchanged() {
        let h = valid_history();
        let s = sanitize(&h);
        assert_eq!(s.len(), h.len());
    }

    #[test]
    fn test_orphan_tool_message_dropped() {
        let h = vec![
            Message::user("hi"),
            Message::tool("ghost", "output"),
            Message::assistant("hello"),
        ];
        let s = sanitize(&h);
        assert_eq!(s.len(), 2);
        assert!(s.iter().all(|m| m.role != Role::Tool));
    }

    #[test]
    fn test_leading_assistant_tool_call_dropped() {
        let h = vec![
            Message::assistant_with_tool_calls("", vec![call("c1")]),
            Message::tool("c1", "ok"),
            Message::user("hi"),
        ];
        let s = sanitize(&h);
        assert_eq!(s.len(), 1);
        assert_eq!(s[0].role, Role::User);
    }

    #[test]
    fn test_partial_turn_dropped_whole() {
        let h = vec![
            Message::user("run"),
            Message::assistant_with_tool_calls("", vec![call("c1"), call("c2")]),
            Message::tool("c1", "only one result"),
            Message::assistant("done"),
        ];
        let s = sanitize(&h);
        assert_eq!(s.len(), 2);
        assert_eq!(s[0].role, Role::User);
        assert_eq!(s[1].content, "done");
    }

    #[test]
    fn test_mismatched_result_id_dropped() {
        let h = vec![
            Message::user("run"),
            Message::assistant_with_tool_calls("", vec![call("c1")]),
            Message::tool("c9", "wrong id"),
        ];
        let s = sanitize(&h);
        // The stray result is dropped in pass 1, the now-resultless
        // assistant turn in pass 2.
        assert_eq!(s.len(), 1);
        assert_eq!(s[0].role, Role::User);
    }

    #[test]
    fn test_duplicate_results_for_one_call_dropped() {
        let h = vec![
            Message::user("run"),
            Message::assistant_with_tool_calls("", vec![call("c1")]),
            Message::tool("c1", "first"),
            Message::tool("c1", "second"),
        ];
        let s = sanitize(&h);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn test_assistant_tool_call_after_assistant_dropped() {
        let h = vec![
            Message::user("hi"),
            Message::assistant("plain"),
            Message::assistant_with_tool_calls("", vec![call("c1")]),
            Message::tool("c1", "ok"),
        ];
        let s = sanitize(&h);
        assert_eq!(s.len(), 2);
        assert_eq!(s[1].content, "plain");
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let histories = vec![
            valid_history(),
            vec![
                Message::user("a"),
                Message::assistant_with_tool_calls("", vec![call("c1")]),
                Message::tool("bad", "x"),
                Message::assistant_with_tool_calls("", vec![call("c2")]),
                Message::tool("c2", "y"),
            ],
            vec![
                Message::tool("ghost", "x"),
                Message::assistant_with_tool_calls("", vec![call("c1")]),
                Message::user("hi"),
            ],
        ];

        for h in histories {
            let once = sanitize(&h);
            let twice = sanitize(&once);
            assert_eq!(
                serde_json::to_string(&once).unwrap(),
                serde_json::to_string(&twice).unwrap()
            );
        }
    }

    #[test]
    fn test_estimate_uses_char_ratio() {
        // 10 chars -> ceil(20/5) = 4 tokens
        let h = vec![Message::user("0123456789")];
        assert_eq!(estimate_history_tokens(&h), 4);

        // 11 chars -> ceil(22/5) = 5
        let h = vec![Message::user("0123456789a")];
        assert_eq!(estimate_history_tokens(&h), 5);
    }

    #[test]
    fn test_estimate_counts_tool_calls() {
        let plain = Message::assistant("hi");
        let with_call = Message::assistant_with_tool_calls("hi", vec![call("c1")]);
        assert!(estimate_message_tokens(&with_call) > estimate_message_tokens(&plain));
    }

    #[test]
    fn test_estimate_monotonic_in_appends() {
        let mut h: Vec<Message> = Vec::new();
        let mut last = 0;
        for i in 0..20 {
            h.push(Message::user(format!("message number {}", i)));
            let est = estimate_history_tokens(&h);
            assert!(est >= last);
            last = est;
        }
    }
}
