//! Agent instances and the registry that owns them.
//!
//! An [`AgentInstance`] bundles a workspace, a model candidate chain, a tool
//! registry, a context builder, and memory. The [`AgentRegistry`] creates
//! every instance at startup from configuration, answers "which agent handles
//! this message" through the router, and enforces the sub-agent spawn
//! allow-list.

pub mod context;
pub mod history;
pub mod memory;
pub mod session;
pub mod tools;

use anyhow::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::auth::AuthStore;
use crate::bus::InboundMessage;
use crate::config::Config;
use crate::protocol::{ChatOptions, LLMResponse, Message, ToolDefinition};
use crate::providers::{build_candidates, Attempt, CooldownTracker, FallbackChain};
use crate::routing::{Route, Router};
use crate::workspace;

pub use context::ContextBuilder;
pub use memory::MemoryStore;
pub use session::{Session, SessionStore};
pub use tools::{ToolContext, ToolRegistry, ToolResult};

/// Default agent id when configuration names none.
pub const DEFAULT_AGENT_ID: &str = "main";

pub struct AgentInstance {
    /// Normalized id: lowercase, trimmed.
    pub id: String,
    pub name: String,
    pub workspace: PathBuf,
    pub model: String,
    pub summary_model: Option<String>,
    pub max_iterations: usize,
    pub max_tokens: usize,
    pub temperature: f32,
    pub context_window: usize,
    pub chain: FallbackChain,
    pub context: ContextBuilder,
    pub tools: Arc<ToolRegistry>,
    pub memory: Arc<MemoryStore>,
    /// Agent ids this agent may spawn; `"*"` allows any, empty denies all.
    pub subagents: Vec<String>,
}

impl AgentInstance {
    pub fn chat_options(&self) -> ChatOptions {
        ChatOptions {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }

    pub fn main_session_key(&self) -> String {
        crate::routing::main_session_key(&self.id)
    }

    /// One model call. Agents with a single candidate skip the chain
    /// bookkeeping and call the provider directly.
    pub async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<(LLMResponse, Vec<Attempt>)> {
        let opts = self.chat_options();
        if self.chain.candidates().len() > 1 {
            return self.chain.chat(messages, tools, &opts).await;
        }
        let candidate = self
            .chain
            .primary()
            .ok_or_else(|| anyhow::anyhow!("Agent {} has no model candidates", self.id))?;
        let response = candidate
            .provider
            .chat(messages, tools, &candidate.model, &opts)
            .await?;
        Ok((response, Vec::new()))
    }

    /// Call the summary model (primary model when none is configured)
    /// without tools.
    pub async fn summarize_chat(&self, messages: &[Message]) -> Result<LLMResponse> {
        let candidate = self
            .chain
            .primary()
            .ok_or_else(|| anyhow::anyhow!("Agent {} has no model candidates", self.id))?;
        let model = self.summary_model.as_deref().unwrap_or(&candidate.model);
        candidate
            .provider
            .chat(messages, &[], model, &self.chat_options())
            .await
    }
}

pub struct AgentRegistry {
    agents: HashMap<String, Arc<AgentInstance>>,
    order: Vec<String>,
    router: Router,
}

impl AgentRegistry {
    /// Build every configured agent and the router over them.
    pub fn from_config(
        config: &Config,
        auth: &AuthStore,
        cooldowns: Arc<CooldownTracker>,
    ) -> Result<Self> {
        let mut agents = HashMap::new();
        let mut order = Vec::new();
        let mut declared: Vec<(String, bool)> = Vec::new();

        for entry in &config.agents {
            let id = entry.id.trim().to_lowercase();
            if agents.contains_key(&id) {
                warn!("Duplicate agent id '{}' ignored", id);
                continue;
            }

            let workspace_dir = entry
                .workspace
                .clone()
                .unwrap_or_else(|| config.paths.workspace_for(&id));
            workspace::init_workspace(&workspace_dir)?;

            let memory = Arc::new(MemoryStore::new(workspace_dir.clone()));
            if let Err(e) = memory.migrate_legacy_user_file() {
                warn!("USER.md migration failed for agent {}: {:#}", id, e);
            }

            let registry = Arc::new(ToolRegistry::new());
            tools::register_memory_tools(&registry, Arc::clone(&memory));

            let mut models = vec![entry.model.clone()];
            models.extend(entry.fallback_models.iter().cloned());
            let candidates = build_candidates(&models, config, auth)?;
            let chain = FallbackChain::new(candidates, Arc::clone(&cooldowns));

            let name = entry.name.clone().unwrap_or_else(|| id.clone());
            let context = ContextBuilder::new(
                &name,
                &entry.model,
                workspace_dir.clone(),
                Arc::clone(&memory),
                Arc::clone(&registry),
                entry.skills.clone(),
            );

            let instance = Arc::new(AgentInstance {
                id: id.clone(),
                name,
                workspace: workspace_dir,
                model: entry.model.clone(),
                summary_model: entry.summary_model.clone(),
                max_iterations: entry.max_iterations,
                max_tokens: entry.max_tokens,
                temperature: entry.temperature,
                context_window: entry.context_window,
                chain,
                context,
                tools: registry,
                memory,
                subagents: entry.subagents.clone(),
            });

            info!("Configured agent '{}' (model {})", id, entry.model);
            declared.push((id.clone(), entry.default));
            order.push(id.clone());
            agents.insert(id, instance);
        }

        let router = Router::new(
            config.bindings.clone(),
            &declared,
            &config.routing.dm_scope,
            config.routing.identity_links.clone(),
        );

        Ok(Self {
            agents,
            order,
            router,
        })
    }

    /// Assemble a registry from pre-built instances (tests, embedders).
    pub fn new(instances: Vec<Arc<AgentInstance>>, router: Router) -> Self {
        let mut agents = HashMap::new();
        let mut order = Vec::new();
        for instance in instances {
            order.push(instance.id.clone());
            agents.insert(instance.id.clone(), instance);
        }
        Self {
            agents,
            order,
            router,
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<AgentInstance>> {
        self.agents.get(&id.trim().to_lowercase()).cloned()
    }

    pub fn default_agent(&self) -> Arc<AgentInstance> {
        self.get(self.router.default_agent())
            .or_else(|| self.order.first().and_then(|id| self.get(id)))
            .expect("registry has no agents")
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn ids(&self) -> &[String] {
        &self.order
    }

    /// Route an inbound message to `(agent, route)`.
    ///
    /// An explicit `agent:`-prefixed session key re-selects the agent to
    /// match the key; any other explicit key overrides only the derived
    /// session key.
    pub fn resolve(&self, msg: &InboundMessage) -> (Arc<AgentInstance>, Route) {
        let peer = msg.peer();
        let parent = msg.parent_peer();
        let mut route = self.router.resolve(
            &msg.channel,
            msg.account_id(),
            &peer,
            parent.as_ref(),
            msg.guild_id(),
            msg.team_id(),
        );

        if let Some(explicit) = msg.session_key.as_deref().filter(|k| !k.is_empty()) {
            let explicit = explicit.to_ascii_lowercase();
            if let Some(agent_id) = explicit.strip_prefix("agent:").and_then(|rest| {
                rest.split(':').next().map(|id| id.to_string())
            }) {
                if self.router.is_known(&agent_id) {
                    route.agent_id = agent_id;
                    route.main_session_key =
                        crate::routing::main_session_key(&route.agent_id);
                    route.session_key = explicit;
                } else {
                    info!(
                        "Session key '{}' names unknown agent; using '{}'",
                        explicit, route.agent_id
                    );
                }
            } else {
                route.session_key = explicit;
            }
        }

        let agent = self
            .get(&route.agent_id)
            .unwrap_or_else(|| self.default_agent());
        (agent, route)
    }

    /// Sub-agent spawn policy: exact id match or `"*"`; an empty list
    /// denies all spawns.
    pub fn can_spawn(&self, parent_id: &str, child_id: &str) -> bool {
        let child_id = child_id.trim().to_lowercase();
        if !self.agents.contains_key(&child_id) {
            return false;
        }
        let Some(parent) = self.get(parent_id) else {
            return false;
        };
        parent
            .subagents
            .iter()
            .any(|allowed| allowed == "*" || allowed.to_lowercase() == child_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentEntry, OllamaConfig};
    use crate::paths::Paths;

    fn test_config(tmp: &std::path::Path, agents: Vec<AgentEntry>) -> Config {
        let mut config = Config::default();
        config.paths = Paths {
            home: tmp.to_path_buf(),
            config_file: tmp.join("config.toml"),
            auth_file: tmp.join("auth.json"),
            state_file: tmp.join("state.json"),
            sessions_dir: tmp.join("sessions"),
        };
        // Ollama needs no credentials, which keeps registry tests hermetic.
        config.providers.ollama = Some(OllamaConfig {
            endpoint: "http://localhost:11434".to_string(),
        });
        config.agents = agents;
        config
    }

    fn entry(id: &str) -> AgentEntry {
        AgentEntry {
            id: id.to_string(),
            model: "ollama/llama3".to_string(),
            ..AgentEntry::default()
        }
    }

    fn registry(config: &Config) -> AgentRegistry {
        let auth = AuthStore::new(config.paths.auth_file.clone());
        AgentRegistry::from_config(config, &auth, Arc::new(CooldownTracker::new())).unwrap()
    }

    #[test]
    fn test_from_config_normalizes_ids_and_seeds_workspace() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), vec![entry("  Main ")]);
        let registry = registry(&config);

        let agent = registry.get("main").unwrap();
        assert_eq!(agent.id, "main");
        assert!(agent.workspace.join("SOUL.md").exists());
    }

    #[test]
    fn test_resolve_honors_agent_scoped_session_key() {
        let tmp = tempfile::tempdir().unwrap();
        let mut research = entry("research");
        research.default = false;
        let config = test_config(tmp.path(), vec![entry("main"), research]);
        let registry = registry(&config);

        let mut msg = InboundMessage::new("cli", "me", "direct", "hi");
        msg.session_key = Some("agent:research:cli:dm:me".to_string());

        let (agent, route) = registry.resolve(&msg);
        assert_eq!(agent.id, "research");
        assert_eq!(route.session_key, "agent:research:cli:dm:me");
        assert_eq!(route.main_session_key, "agent:research:main");
    }

    #[test]
    fn test_resolve_keeps_plain_explicit_session_key() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), vec![entry("main")]);
        let registry = registry(&config);

        let mut msg = InboundMessage::new("cli", "me", "direct", "hi");
        msg.session_key = Some("cli:default".to_string());

        let (agent, route) = registry.resolve(&msg);
        assert_eq!(agent.id, "main");
        assert_eq!(route.session_key, "cli:default");
    }

    #[test]
    fn test_unknown_agent_in_session_key_falls_to_routed() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), vec![entry("main")]);
        let registry = registry(&config);

        let mut msg = InboundMessage::new("cli", "me", "direct", "hi");
        msg.session_key = Some("agent:ghost:whatever".to_string());

        let (agent, route) = registry.resolve(&msg);
        assert_eq!(agent.id, "main");
        // The bad key is not honored
        assert_eq!(route.session_key, "agent:main:cli:dm:me");
    }

    #[test]
    fn test_can_spawn_allow_list() {
        let tmp = tempfile::tempdir().unwrap();
        let mut main = entry("main");
        main.subagents = vec!["research".to_string()];
        let mut research = entry("research");
        research.default = false;
        let mut open = entry("open");
        open.default = false;
        open.subagents = vec!["*".to_string()];
        let config = test_config(tmp.path(), vec![main, research, open]);
        let registry = registry(&config);

        assert!(registry.can_spawn("main", "research"));
        assert!(!registry.can_spawn("main", "open"));
        assert!(!registry.can_spawn("research", "main")); // empty list denies
        assert!(registry.can_spawn("open", "main"));
        assert!(registry.can_spawn("open", "research"));
        assert!(!registry.can_spawn("open", "ghost")); // unknown child
    }
}
