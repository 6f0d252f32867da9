//! History summarization and emergency compression.
//!
//! Triggered summarization runs in the background after a turn when the
//! estimated history tokens cross the threshold; it folds everything but the
//! last few turns into the structured summary. Emergency compression is the
//! synchronous last resort when a provider rejects the context outright.

use anyhow::Result;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::agent::context::parse_summary;
use crate::agent::history::estimate_message_tokens;
use crate::agent::session::SessionStore;
use crate::agent::AgentInstance;
use crate::protocol::{Message, Role};

/// Turns kept verbatim out of every summarization pass.
pub const KEEP_LAST: usize = 4;

/// Above this many candidate messages, summarize in two concurrent halves.
const SPLIT_THRESHOLD: usize = 10;

/// Time limit for one summarization run.
pub const SUMMARY_TIMEOUT: Duration = Duration::from_secs(120);

/// Summarization trigger threshold in estimated tokens.
pub fn summary_threshold(context_window: usize) -> usize {
    context_window * 3 / 4
}

const SUMMARIZE_INSTRUCTION: &str = "Summarize this conversation for a future \
session. Respond with ONLY a JSON object, no prose and no code fences, with \
these fields: {\"overview\": string, \"scheduled_tasks\": [string], \
\"preferences\": [string], \"pending_actions\": [string], \"key_facts\": \
[string]}. Keep every commitment, preference, and open question.";

const MERGE_INSTRUCTION: &str = "Merge these two JSON conversation summaries \
into one JSON object with the same fields: {\"overview\": string, \
\"scheduled_tasks\": [string], \"preferences\": [string], \
\"pending_actions\": [string], \"key_facts\": [string]}. Respond with ONLY \
the merged JSON object.";

/// Summarize everything but the last [`KEEP_LAST`] turns of a session, then
/// truncate. The summary is accepted only when it parses as JSON; on
/// rejection the history is still truncated so the trigger does not refire
/// every turn.
pub async fn summarize_session(
    agent: &AgentInstance,
    sessions: &SessionStore,
    key: &str,
) -> Result<()> {
    let history = sessions.get_history(key);
    if history.len() <= KEEP_LAST {
        return Ok(());
    }

    let prior_summary = sessions.get_summary(key);
    let head = &history[..history.len() - KEEP_LAST];

    // A single turn larger than half the context window cannot be fed to
    // the summary model; leave it out and note the omission.
    let oversized_limit = agent.context_window / 2;
    let batch: Vec<&Message> = head
        .iter()
        .filter(|m| estimate_message_tokens(m) <= oversized_limit)
        .collect();
    let omitted = head.len() - batch.len();

    let raw = if batch.len() > SPLIT_THRESHOLD {
        let mid = batch.len() / 2;
        let (first, second) = batch.split_at(mid);
        let (a, b) = tokio::join!(
            summarize_batch(agent, first, Some(&prior_summary)),
            summarize_batch(agent, second, None)
        );
        merge_summaries(agent, &a?, &b?).await?
    } else {
        summarize_batch(agent, &batch, Some(&prior_summary)).await?
    };

    match parse_summary(&raw) {
        Some(mut parsed) => {
            if omitted > 0 {
                parsed.overview.push_str(&format!(
                    " ({} oversized message(s) were omitted from this summary.)",
                    omitted
                ));
            }
            sessions.set_summary(key, &serde_json::to_string(&parsed)?);
            info!(
                "Summarized session {} ({} messages folded)",
                key,
                head.len()
            );
        }
        None => {
            warn!(
                "Summary for session {} was not valid JSON; truncating without it",
                key
            );
        }
    }

    sessions.truncate(key, KEEP_LAST);
    sessions.save(key)?;
    Ok(())
}

async fn summarize_batch(
    agent: &AgentInstance,
    messages: &[&Message],
    prior_summary: Option<&str>,
) -> Result<String> {
    let mut prompt = String::new();
    if let Some(prior) = prior_summary.filter(|s| !s.is_empty()) {
        if let Some(parsed) = parse_summary(prior) {
            prompt.push_str("Earlier summary (fold its content in):\n");
            prompt.push_str(&serde_json::to_string(&parsed)?);
            prompt.push_str("\n\n");
        }
    }
    prompt.push_str("Conversation:\n");
    prompt.push_str(&render_transcript(messages));
    prompt.push_str("\n\n");
    prompt.push_str(SUMMARIZE_INSTRUCTION);

    let response = agent.summarize_chat(&[Message::user(prompt)]).await?;
    Ok(response.content)
}

async fn merge_summaries(agent: &AgentInstance, first: &str, second: &str) -> Result<String> {
    let prompt = format!(
        "Summary A:\n{}\n\nSummary B:\n{}\n\n{}",
        first, second, MERGE_INSTRUCTION
    );
    let response = agent.summarize_chat(&[Message::user(prompt)]).await?;
    Ok(response.content)
}

fn render_transcript(messages: &[&Message]) -> String {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            if m.has_tool_calls() {
                let calls: Vec<String> = m
                    .tool_calls
                    .iter()
                    .map(|c| format!("{}({})", c.name, c.arguments_json()))
                    .collect();
                format!("{}: {} [calls: {}]", role, m.content, calls.join(", "))
            } else {
                format!("{}: {}", role, m.content)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Drop the oldest half of the turns between the first and last message.
///
/// The first turn and the very last turn are always preserved, and the
/// dropped count is disclosed in the history itself: appended to a system
/// first-turn when one exists, otherwise as a new leading system turn. The
/// context builder folds that turn into the next system prompt, so the
/// model sees the note. Histories of four turns or fewer pass through
/// unchanged. Safe to apply repeatedly.
pub fn emergency_compress(history: &[Message]) -> Vec<Message> {
    if history.len() <= 4 {
        return history.to_vec();
    }

    let middle = &history[1..history.len() - 1];
    let drop = middle.len().div_ceil(2);
    debug!("Compression dropping {} message(s)", drop);

    let mut out = Vec::with_capacity(history.len() - drop + 1);
    if history[0].role == Role::System {
        let mut first = history[0].clone();
        first.content.push_str(&format!("\n\n{}", compression_note(drop)));
        out.push(first);
    } else {
        out.push(Message::system(compression_note(drop)));
        out.push(history[0].clone());
    }
    out.extend_from_slice(&middle[drop..]);
    out.push(history[history.len() - 1].clone());
    out
}

fn compression_note(dropped: usize) -> String {
    format!(
        "[Context note: {} earlier message(s) were dropped to fit the context window.]",
        dropped
    )
}

/// Case-insensitive substring detector for context-window exhaustion.
/// Deliberately loose; misclassification is visible at debug level.
pub fn is_context_window_error(text: &str) -> bool {
    let lower = text.to_lowercase();
    let matched = ["token", "context", "invalidparameter", "length"]
        .iter()
        .any(|needle| lower.contains(needle));
    if matched {
        debug!("Treating provider error as context exhaustion: {}", text);
    }
    matched
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history_of(n: usize) -> Vec<Message> {
        let mut h = vec![Message::system("prompt")];
        for i in 1..n {
            h.push(Message::user(format!("m{}", i)));
        }
        h
    }

    #[test]
    fn test_compress_preserves_first_and_last() {
        let h = history_of(6);
        let compressed = emergency_compress(&h);

        assert!(compressed.len() < h.len());
        assert!(compressed.len() <= 5);
        assert!(compressed[0].content.starts_with("prompt"));
        assert!(compressed[0]
            .content
            .contains("dropped to fit the context window"));
        assert_eq!(compressed.last().unwrap().content, "m5");
    }

    #[test]
    fn test_compress_short_history_unchanged() {
        let h = history_of(4);
        assert_eq!(emergency_compress(&h).len(), 4);

        let h = history_of(3);
        assert_eq!(emergency_compress(&h).len(), 3);
    }

    #[test]
    fn test_compress_strictly_shrinks_above_four() {
        for n in 5..20 {
            let h = history_of(n);
            assert!(emergency_compress(&h).len() < n, "history of {}", n);
        }
    }

    #[test]
    fn test_compress_is_safe_to_repeat() {
        let mut h = history_of(12);
        for _ in 0..10 {
            h = emergency_compress(&h);
        }
        // Converges instead of collapsing to nothing
        assert!(h.len() >= 3);
        assert_eq!(h.last().unwrap().content, "m11");
    }

    #[test]
    fn test_non_system_first_turn_gets_a_leading_note() {
        let h: Vec<Message> = (0..6).map(|i| Message::user(format!("m{}", i))).collect();
        let compressed = emergency_compress(&h);

        assert!(compressed.len() < h.len());
        assert_eq!(compressed[0].role, Role::System);
        assert!(compressed[0].content.contains("2 earlier message(s)"));
        // The original first turn survives right after the note
        assert_eq!(compressed[1].content, "m0");
        assert_eq!(compressed.last().unwrap().content, "m5");
    }

    #[test]
    fn test_repeated_compression_reuses_the_note_turn() {
        let mut h: Vec<Message> = (0..12).map(|i| Message::user(format!("m{}", i))).collect();
        h = emergency_compress(&h);
        h = emergency_compress(&h);

        // Exactly one system note turn, annotated twice
        let notes = h.iter().filter(|m| m.role == Role::System).count();
        assert_eq!(notes, 1);
        assert_eq!(h[0].role, Role::System);
        assert_eq!(h[0].content.matches("Context note").count(), 2);
        assert_eq!(h.last().unwrap().content, "m11");
    }

    #[test]
    fn test_context_error_detection() {
        assert!(is_context_window_error(
            "InvalidParameter: max tokens exceeded"
        ));
        assert!(is_context_window_error("Context length exceeded"));
        assert!(is_context_window_error("too many tokens"));
        assert!(!is_context_window_error("connection refused"));
    }

    #[test]
    fn test_summary_threshold() {
        assert_eq!(summary_threshold(128_000), 96_000);
    }
}
