//! Session state and its persistent store.
//!
//! One `Session` per session key: the ordered message log plus an optional
//! structured summary. The store keeps every session in memory behind one
//! readers-writer lock; file I/O always works on a snapshot taken under the
//! read lock so long writes never block the scheduler.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{debug, warn};

use crate::protocol::Message;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub key: String,

    #[serde(default)]
    pub messages: Vec<Message>,

    /// Structured summary (JSON string); empty when absent.
    #[serde(default)]
    pub summary: String,

    pub created: DateTime<Utc>,

    pub updated: DateTime<Utc>,
}

impl Session {
    pub fn new(key: &str) -> Self {
        let now = Utc::now();
        Self {
            key: key.to_string(),
            messages: Vec::new(),
            summary: String::new(),
            created: now,
            updated: now,
        }
    }
}

/// Replace path-unsafe characters (notably `:` in session keys) so the key
/// can serve as a filename on every platform. The original key survives
/// inside the file.
fn escape_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub struct SessionStore {
    dir: PathBuf,
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionStore {
    /// Open a store over `dir`, loading every parseable session file.
    /// Malformed files are skipped silently.
    pub fn open(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create session directory {}", dir.display()))?;

        let mut sessions = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            match fs::read_to_string(&path)
                .ok()
                .and_then(|raw| serde_json::from_str::<Session>(&raw).ok())
            {
                Some(session) => {
                    sessions.insert(session.key.clone(), session);
                }
                None => {
                    debug!("Skipping malformed session file {}", path.display());
                }
            }
        }
        debug!("Loaded {} sessions from {}", sessions.len(), dir.display());

        Ok(Self {
            dir,
            sessions: RwLock::new(sessions),
        })
    }

    pub fn get_or_create(&self, key: &str) -> Session {
        let mut sessions = self.sessions.write().expect("session lock poisoned");
        sessions
            .entry(key.to_string())
            .or_insert_with(|| Session::new(key))
            .clone()
    }

    pub fn append(&self, key: &str, message: Message) {
        let mut sessions = self.sessions.write().expect("session lock poisoned");
        let session = sessions
            .entry(key.to_string())
            .or_insert_with(|| Session::new(key));
        session.messages.push(message);
        session.updated = Utc::now();
    }

    /// Append an assistant turn carrying tool calls.
    pub fn append_with_tool_calls(
        &self,
        key: &str,
        content: &str,
        calls: Vec<crate::protocol::ToolCall>,
    ) {
        self.append(key, Message::assistant_with_tool_calls(content, calls));
    }

    /// Ordered copy of a session's messages; empty when unknown.
    pub fn get_history(&self, key: &str) -> Vec<Message> {
        self.sessions
            .read()
            .expect("session lock poisoned")
            .get(key)
            .map(|s| s.messages.clone())
            .unwrap_or_default()
    }

    pub fn get_summary(&self, key: &str) -> String {
        self.sessions
            .read()
            .expect("session lock poisoned")
            .get(key)
            .map(|s| s.summary.clone())
            .unwrap_or_default()
    }

    pub fn set_summary(&self, key: &str, summary: &str) {
        let mut sessions = self.sessions.write().expect("session lock poisoned");
        let session = sessions
            .entry(key.to_string())
            .or_insert_with(|| Session::new(key));
        session.summary = summary.to_string();
        session.updated = Utc::now();
    }

    /// Drop all but the last `keep_last` messages.
    pub fn truncate(&self, key: &str, keep_last: usize) {
        let mut sessions = self.sessions.write().expect("session lock poisoned");
        if let Some(session) = sessions.get_mut(key) {
            let len = session.messages.len();
            if len > keep_last {
                session.messages.drain(..len - keep_last);
                session.updated = Utc::now();
            }
        }
    }

    /// Replace the history wholesale (emergency compression).
    pub fn set_history(&self, key: &str, messages: Vec<Message>) {
        let mut sessions = self.sessions.write().expect("session lock poisoned");
        let session = sessions
            .entry(key.to_string())
            .or_insert_with(|| Session::new(key));
        session.messages = messages;
        session.updated = Utc::now();
    }

    /// Empty messages and summary, keeping the session itself alive.
    pub fn clear(&self, key: &str) {
        let mut sessions = self.sessions.write().expect("session lock poisoned");
        if let Some(session) = sessions.get_mut(key) {
            session.messages.clear();
            session.summary.clear();
            session.updated = Utc::now();
        }
    }

    pub fn message_count(&self, key: &str) -> usize {
        self.sessions
            .read()
            .expect("session lock poisoned")
            .get(key)
            .map(|s| s.messages.len())
            .unwrap_or(0)
    }

    /// Persist one session atomically: snapshot under the read lock, then
    /// serialize and write-temp-then-rename with the lock released.
    pub fn save(&self, key: &str) -> Result<()> {
        let snapshot = {
            let sessions = self.sessions.read().expect("session lock poisoned");
            match sessions.get(key) {
                Some(session) => session.clone(),
                None => return Ok(()),
            }
        };

        let path = self.dir.join(format!("{}.json", escape_key(key)));
        let content = serde_json::to_string_pretty(&snapshot)?;

        let tmp_path = path.with_extension(format!(
            "{}.{}.tmp",
            std::process::id(),
            uuid::Uuid::new_v4().as_simple()
        ));
        fs::write(&tmp_path, &content)?;
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("Failed to persist session {}", key))?;

        debug!("Saved session {} to {}", key, path.display());
        Ok(())
    }

    /// Best-effort save: failures are logged, never propagated.
    pub fn save_or_log(&self, key: &str) {
        if let Err(e) = self.save(key) {
            warn!("Failed to persist session {}: {:#}", key, e);
        }
    }
}
