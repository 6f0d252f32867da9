//! Context builder: turns session state into a provider-ready message list.
//!
//! The first message is always the assembled system prompt; after it comes
//! the sanitized history and, on the first pass of a turn, the new user
//! message.

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use super::history;
use super::memory::MemoryStore;
use super::tools::ToolRegistry;
use crate::protocol::{Message, Role};
use crate::skills;

/// Bootstrap files loaded into the prompt, in order. The legacy `USER.md`
/// is deliberately absent: its content belongs in memory, not the prompt.
const BOOTSTRAP_FILES: &[&str] = &["AGENTS.md", "SOUL.md", "IDENTITY.md"];

const SECTION_SEPARATOR: &str = "\n\n---\n\n";

/// Structured summary carried on a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSummary {
    pub overview: String,
    pub scheduled_tasks: Vec<String>,
    pub preferences: Vec<String>,
    pub pending_actions: Vec<String>,
    pub key_facts: Vec<String>,
}

impl SessionSummary {
    pub fn render(&self) -> String {
        let mut block = String::from("## Summary of Previous Conversation\n\n");
        block.push_str(&self.overview);

        for (title, items) in [
            ("Scheduled tasks", &self.scheduled_tasks),
            ("Preferences", &self.preferences),
            ("Pending actions", &self.pending_actions),
            ("Key facts", &self.key_facts),
        ] {
            if items.is_empty() {
                continue;
            }
            block.push_str(&format!("\n\n{}:\n", title));
            for item in items {
                block.push_str(&format!("- {}\n", item));
            }
        }

        block.trim_end().to_string()
    }
}

/// Parse a stored summary string, tolerating markdown code fences.
pub fn parse_summary(raw: &str) -> Option<SessionSummary> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let body = if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.split_once('\n').map(|(_, b)| b).unwrap_or(rest);
        rest.strip_suffix("```").unwrap_or(rest)
    } else {
        trimmed
    };

    serde_json::from_str(body).ok()
}

pub struct ContextBuilder {
    agent_name: String,
    model: String,
    workspace: PathBuf,
    memory: Arc<MemoryStore>,
    tools: Arc<ToolRegistry>,
    skills_filter: Vec<String>,
}

impl ContextBuilder {
    pub fn new(
        agent_name: &str,
        model: &str,
        workspace: PathBuf,
        memory: Arc<MemoryStore>,
        tools: Arc<ToolRegistry>,
        skills_filter: Vec<String>,
    ) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            model: model.to_string(),
            workspace,
            memory,
            tools,
            skills_filter,
        }
    }

    /// Assemble the full message sequence for one provider call.
    pub fn build_messages(
        &self,
        history: &[Message],
        summary: &str,
        current_user_message: &str,
        channel: &str,
        chat_id: &str,
    ) -> Vec<Message> {
        let mut sanitized = history::sanitize(history);

        // Leading system turns persisted into the session (emergency
        // compression leaves its dropped-message note there) fold into the
        // constructed prompt, so exactly one system turn reaches the
        // provider.
        let mut history_notes: Vec<String> = Vec::new();
        while sanitized.first().map(|m| m.role == Role::System) == Some(true) {
            history_notes.push(sanitized.remove(0).content);
        }

        let mut messages = vec![Message::system(self.build_system_prompt(
            summary,
            channel,
            chat_id,
            &history_notes,
        ))];
        messages.extend(sanitized);
        if !current_user_message.is_empty() {
            messages.push(Message::user(current_user_message));
        }
        messages
    }

    fn build_system_prompt(
        &self,
        summary: &str,
        channel: &str,
        chat_id: &str,
        history_notes: &[String],
    ) -> String {
        let mut sections = vec![self.identity_block()];

        for name in BOOTSTRAP_FILES {
            let path = self.workspace.join(name);
            match fs::read_to_string(&path) {
                Ok(content) if !content.trim().is_empty() => {
                    sections.push(format!("# {}\n\n{}", name, content.trim()));
                }
                _ => {}
            }
        }

        let installed = skills::filter_skills(
            skills::load_skills(&self.workspace),
            &self.skills_filter,
        );
        let skills_block = skills::skills_prompt(&installed);
        if !skills_block.is_empty() {
            sections.push(skills_block);
        }

        let memory_block = self.memory.get_memory_context();
        if !memory_block.is_empty() {
            sections.push(memory_block);
        }

        if let Some(parsed) = parse_summary(summary) {
            sections.push(parsed.render());
        }

        for note in history_notes {
            if !note.trim().is_empty() {
                sections.push(note.trim().to_string());
            }
        }

        sections.push(format!(
            "## Current Session\nchannel={} | chat_id={}",
            channel, chat_id
        ));

        sections.join(SECTION_SEPARATOR)
    }

    fn identity_block(&self) -> String {
        let now = Local::now();
        let mut lines = vec![
            format!(
                "You are {}, a personal AI agent running inside krill.",
                self.agent_name
            ),
            String::new(),
            "## Runtime".to_string(),
            format!(
                "time={} | os={} | arch={} | model={}",
                now.format("%Y-%m-%d %H:%M:%S %Z"),
                std::env::consts::OS,
                std::env::consts::ARCH,
                self.model
            ),
            format!("workspace={}", self.workspace.display()),
        ];

        let summaries = self.tools.summaries();
        if !summaries.is_empty() {
            lines.push(String::new());
            lines.push("## Tools".to_string());
            lines.push("Available tools:".to_string());
            lines.extend(summaries);
        }

        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tools::register_memory_tools;
    use crate::protocol::Role;

    fn builder(tmp: &tempfile::TempDir) -> ContextBuilder {
        let memory = Arc::new(MemoryStore::new(tmp.path().to_path_buf()));
        let tools = Arc::new(ToolRegistry::new());
        register_memory_tools(&tools, Arc::clone(&memory));
        ContextBuilder::new(
            "main",
            "anthropic/claude-sonnet-4-5",
            tmp.path().to_path_buf(),
            memory,
            tools,
            Vec::new(),
        )
    }

    #[test]
    fn test_first_message_is_single_system_prompt() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = builder(&tmp);

        let messages = ctx.build_messages(&[], "", "hello", "cli", "direct");
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, Role::User);
        assert_eq!(messages[1].content, "hello");

        // Exactly one system turn
        let systems = messages.iter().filter(|m| m.role == Role::System).count();
        assert_eq!(systems, 1);
    }

    #[test]
    fn test_system_prompt_contains_tool_summaries_and_session() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = builder(&tmp);

        let messages = ctx.build_messages(&[], "", "hi", "telegram", "42");
        let prompt = &messages[0].content;
        assert!(prompt.contains("- memory_remember:"));
        assert!(prompt.contains("channel=telegram | chat_id=42"));
        assert!(prompt.contains(SECTION_SEPARATOR));
    }

    #[test]
    fn test_bootstrap_files_loaded_but_user_md_excluded() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("SOUL.md"), "Be kind.").unwrap();
        fs::write(tmp.path().join("USER.md"), "SECRET-MARKER").unwrap();

        let ctx = builder(&tmp);
        let messages = ctx.build_messages(&[], "", "hi", "cli", "direct");
        let prompt = &messages[0].content;
        assert!(prompt.contains("Be kind."));
        assert!(!prompt.contains("SECRET-MARKER"));
    }

    #[test]
    fn test_parseable_summary_rendered() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = builder(&tmp);

        let summary =
            r#"{"overview":"We planned a trip.","key_facts":["Flies on Friday"]}"#;
        let messages = ctx.build_messages(&[], summary, "hi", "cli", "direct");
        let prompt = &messages[0].content;
        assert!(prompt.contains("## Summary of Previous Conversation"));
        assert!(prompt.contains("We planned a trip."));
        assert!(prompt.contains("- Flies on Friday"));
    }

    #[test]
    fn test_unparseable_summary_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = builder(&tmp);

        let messages = ctx.build_messages(&[], "not json at all", "hi", "cli", "direct");
        assert!(!messages[0].content.contains("Summary of Previous Conversation"));
    }

    #[test]
    fn test_history_sanitized_and_appended() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = builder(&tmp);

        let history = vec![
            Message::user("earlier"),
            Message::tool("ghost", "orphaned"),
            Message::assistant("reply"),
        ];
        let messages = ctx.build_messages(&history, "", "now", "cli", "direct");

        // system + 2 surviving history turns + current user message
        assert_eq!(messages.len(), 4);
        assert!(messages.iter().all(|m| m.role != Role::Tool));
    }

    #[test]
    fn test_leading_system_turns_fold_into_the_prompt() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = builder(&tmp);

        let history = vec![
            Message::system("[Context note: 3 earlier message(s) were dropped to fit the context window.]"),
            Message::user("what were we doing?"),
            Message::assistant("planning"),
        ];
        let messages = ctx.build_messages(&history, "", "go on", "cli", "direct");

        // One system turn only, carrying the note
        let systems: Vec<_> = messages.iter().filter(|m| m.role == Role::System).collect();
        assert_eq!(systems.len(), 1);
        assert!(systems[0].content.contains("3 earlier message(s)"));

        // The rest of the history follows unchanged
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1].content, "what were we doing?");
        assert_eq!(messages[2].content, "planning");
    }

    #[test]
    fn test_empty_user_message_not_appended() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = builder(&tmp);

        let history = vec![Message::user("already here")];
        let messages = ctx.build_messages(&history, "", "", "cli", "direct");
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn test_parse_summary_strips_fences() {
        let fenced = "```json\n{\"overview\":\"ok\"}\n```";
        let parsed = parse_summary(fenced).unwrap();
        assert_eq!(parsed.overview, "ok");

        assert!(parse_summary("").is_none());
        assert!(parse_summary("plain prose").is_none());
    }
}
