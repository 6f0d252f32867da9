//! Runtime state: the last active conversation.
//!
//! Recorded after routing for every external channel so heartbeat and other
//! scheduled work can target wherever the user last talked to the agent.
//! Persisted with the same temp-file-then-rename discipline as sessions.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RuntimeState {
    /// `"<channel>:<chat_id>"` of the last external conversation.
    #[serde(default)]
    last_channel: String,

    #[serde(default)]
    last_chat_id: String,
}

pub struct StateManager {
    path: PathBuf,
    state: Mutex<RuntimeState>,
}

impl StateManager {
    /// Load state from disk; a missing or corrupt file starts empty.
    pub fn load(path: PathBuf) -> Self {
        let state = fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    /// Record the conversation a message just arrived on.
    pub fn record_last_route(&self, channel: &str, chat_id: &str) -> Result<()> {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            state.last_channel = format!("{}:{}", channel, chat_id);
            state.last_chat_id = chat_id.to_string();
        }
        self.save()
    }

    /// The last external `(channel, chat_id)`, if any was recorded.
    pub fn last_route(&self) -> Option<(String, String)> {
        let state = self.state.lock().expect("state lock poisoned");
        if state.last_channel.is_empty() {
            return None;
        }
        let channel = state
            .last_channel
            .split_once(':')
            .map(|(c, _)| c.to_string())
            .unwrap_or_else(|| state.last_channel.clone());
        Some((channel, state.last_chat_id.clone()))
    }

    fn save(&self) -> Result<()> {
        let snapshot = self.state.lock().expect("state lock poisoned").clone();

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(&snapshot)?;
        let tmp_path = self.path.with_extension(format!(
            "{}.{}.tmp",
            std::process::id(),
            uuid::Uuid::new_v4().as_simple()
        ));

        fs::write(&tmp_path, &content)?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("Failed to persist {}", self.path.display()))?;

        debug!("Saved runtime state to {:?}", self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");

        let state = StateManager::load(path.clone());
        assert!(state.last_route().is_none());

        state.record_last_route("telegram", "42").unwrap();
        assert_eq!(
            state.last_route(),
            Some(("telegram".to_string(), "42".to_string()))
        );

        // Fresh load sees the persisted route
        let reloaded = StateManager::load(path);
        assert_eq!(
            reloaded.last_route(),
            Some(("telegram".to_string(), "42".to_string()))
        );
    }

    #[test]
    fn test_corrupt_state_starts_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        fs::write(&path, "garbage").unwrap();

        let state = StateManager::load(path);
        assert!(state.last_route().is_none());
    }
}
