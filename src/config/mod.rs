//! Runtime configuration loaded from `~/.krill/config.toml`.
//!
//! Every field is defaulted so a missing or partial file still yields a
//! working runtime with a single `main` agent.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use crate::paths::Paths;
use crate::routing::Binding;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved application paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    #[serde(default)]
    pub agents: Vec<AgentEntry>,

    #[serde(default)]
    pub bindings: Vec<Binding>,

    #[serde(default)]
    pub providers: ProvidersConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

/// One configured agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEntry {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_model")]
    pub model: String,

    /// Ordered fallback models tried after the primary fails.
    #[serde(default)]
    pub fallback_models: Vec<String>,

    /// Workspace override; defaults to `~/.krill/workspace[-<id>]`.
    #[serde(default)]
    pub workspace: Option<PathBuf>,

    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_context_window")]
    pub context_window: usize,

    /// Model used for history summarization (defaults to the primary model).
    #[serde(default)]
    pub summary_model: Option<String>,

    /// Marks the default agent for unmatched routes.
    #[serde(default)]
    pub default: bool,

    /// Skill names to expose; empty means all installed skills.
    #[serde(default)]
    pub skills: Vec<String>,

    /// Agent ids this agent may spawn as sub-agents; `"*"` allows any,
    /// empty denies all.
    #[serde(default)]
    pub subagents: Vec<String>,
}

impl Default for AgentEntry {
    fn default() -> Self {
        Self {
            id: crate::agent::DEFAULT_AGENT_ID.to_string(),
            name: None,
            model: default_model(),
            fallback_models: Vec::new(),
            workspace: None,
            max_iterations: default_max_iterations(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            context_window: default_context_window(),
            summary_model: None,
            default: true,
            skills: Vec::new(),
            subagents: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub anthropic: Option<AnthropicConfig>,

    #[serde(default)]
    pub openai: Option<OpenAIConfig>,

    #[serde(default)]
    pub glm: Option<GlmConfig>,

    #[serde(default)]
    pub openrouter: Option<OpenRouterConfig>,

    #[serde(default)]
    pub ollama: Option<OllamaConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicConfig {
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_anthropic_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIConfig {
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlmConfig {
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_glm_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_openrouter_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_endpoint")]
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// `"per-peer"` keeps one session per DM peer; `"main"` merges all DMs
    /// into the agent's main session.
    #[serde(default = "default_dm_scope")]
    pub dm_scope: String,

    /// Canonical name → peer patterns (`channel:kind:id`) that should share
    /// one DM session.
    #[serde(default)]
    pub identity_links: HashMap<String, Vec<String>>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            dm_scope: default_dm_scope(),
            identity_links: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Run background summarization when history crosses the threshold.
    #[serde(default = "default_true")]
    pub summarization: bool,

    /// Final reply used when the model produced no content.
    #[serde(default = "default_reply")]
    pub default_reply: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            summarization: true,
            default_reply: default_reply(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_heartbeat_interval")]
    pub interval_minutes: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: default_heartbeat_interval(),
        }
    }
}

fn default_model() -> String {
    "anthropic/claude-sonnet-4-5".to_string()
}

fn default_max_iterations() -> usize {
    20
}

fn default_max_tokens() -> usize {
    8192
}

fn default_temperature() -> f32 {
    0.7
}

fn default_context_window() -> usize {
    128_000
}

fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_glm_base_url() -> String {
    "https://open.bigmodel.cn/api/paas/v4".to_string()
}

fn default_openrouter_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_ollama_endpoint() -> String {
    "http://localhost:11434".to_string()
}

fn default_dm_scope() -> String {
    "per-peer".to_string()
}

fn default_reply() -> String {
    "I have nothing to add right now.".to_string()
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from the resolved home, tolerating a missing file.
    pub fn load() -> Result<Self> {
        let paths = Paths::resolve()?;
        Self::load_from(paths)
    }

    pub fn load_from(paths: Paths) -> Result<Self> {
        let mut config: Config = if paths.config_file.exists() {
            let raw = fs::read_to_string(&paths.config_file).with_context(|| {
                format!("Failed to read {}", paths.config_file.display())
            })?;
            toml::from_str(&raw).with_context(|| {
                format!("Failed to parse {}", paths.config_file.display())
            })?
        } else {
            Config::default()
        };

        config.paths = paths;
        config.ensure_default_agent();
        Ok(config)
    }

    /// Guarantee at least one agent exists and exactly one is the default.
    fn ensure_default_agent(&mut self) {
        if self.agents.is_empty() {
            self.agents.push(AgentEntry::default());
            return;
        }
        if !self.agents.iter().any(|a| a.default) {
            self.agents[0].default = true;
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_paths(dir: &std::path::Path) -> Paths {
        Paths {
            home: dir.to_path_buf(),
            config_file: dir.join("config.toml"),
            auth_file: dir.join("auth.json"),
            state_file: dir.join("state.json"),
            sessions_dir: dir.join("sessions"),
        }
    }

    #[test]
    fn test_missing_file_yields_default_agent() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load_from(test_paths(tmp.path())).unwrap();

        assert_eq!(config.agents.len(), 1);
        assert_eq!(config.agents[0].id, "main");
        assert!(config.agents[0].default);
        assert!(config.scheduler.summarization);
    }

    #[test]
    fn test_parse_agents_and_bindings() {
        let tmp = tempfile::tempdir().unwrap();
        let raw = r#"
[[agents]]
id = "vip"
model = "openai/gpt-4o"
fallback_models = ["anthropic/claude-sonnet-4-5"]
max_iterations = 5
default = true

[[agents]]
id = "gaming"

[[bindings]]
agent = "vip"
channel = "discord"
peer_kind = "direct"
peer_id = "u1"

[routing]
dm_scope = "main"

[heartbeat]
enabled = true
interval_minutes = 10
"#;
        fs::write(tmp.path().join("config.toml"), raw).unwrap();

        let config = Config::load_from(test_paths(tmp.path())).unwrap();
        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.agents[0].model, "openai/gpt-4o");
        assert_eq!(config.agents[0].fallback_models.len(), 1);
        assert_eq!(config.agents[0].max_iterations, 5);
        assert_eq!(config.agents[1].max_iterations, 20);
        assert_eq!(config.bindings.len(), 1);
        assert_eq!(config.bindings[0].agent, "vip");
        assert_eq!(config.routing.dm_scope, "main");
        assert!(config.heartbeat.enabled);
        assert_eq!(config.heartbeat.interval_minutes, 10);
    }

    #[test]
    fn test_first_agent_becomes_default_when_none_marked() {
        let tmp = tempfile::tempdir().unwrap();
        let raw = r#"
[[agents]]
id = "alpha"

[[agents]]
id = "beta"
"#;
        fs::write(tmp.path().join("config.toml"), raw).unwrap();

        let config = Config::load_from(test_paths(tmp.path())).unwrap();
        assert!(config.agents[0].default);
        assert!(!config.agents[1].default);
    }
}
