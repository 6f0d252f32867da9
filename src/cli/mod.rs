//! Command-line surface.

pub mod agent;
pub mod gateway;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentRegistry, SessionStore};
use crate::auth::AuthStore;
use crate::bus::InMemoryBus;
use crate::config::Config;
use crate::providers::CooldownTracker;
use crate::scheduler::Scheduler;
use crate::state::StateManager;

#[derive(Parser)]
#[command(name = "krill")]
#[command(author, version, about = "A multi-channel personal AI agent runtime")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Talk to an agent (one-shot with -m, interactive shell otherwise)
    Agent(agent::AgentArgs),

    /// Run the scheduler and heartbeat until Ctrl-C
    Gateway,

    /// Show resolved application paths
    Paths,
}

/// Everything a command needs to drive the scheduling core.
pub(crate) struct Runtime {
    pub config: Config,
    pub bus: Arc<InMemoryBus>,
    pub registry: Arc<AgentRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub cancel: CancellationToken,
}

pub(crate) fn build_runtime(model_override: Option<&str>) -> Result<Runtime> {
    let mut config = Config::load()?;
    if let Some(model) = model_override {
        for entry in &mut config.agents {
            if entry.default {
                entry.model = model.to_string();
            }
        }
    }

    let auth = AuthStore::new(config.paths.auth_file.clone());
    let cooldowns = Arc::new(CooldownTracker::new());
    let registry = Arc::new(AgentRegistry::from_config(&config, &auth, cooldowns)?);
    let sessions = Arc::new(SessionStore::open(config.paths.sessions_dir.clone())?);
    let state = Arc::new(StateManager::load(config.paths.state_file.clone()));
    let bus = Arc::new(InMemoryBus::default());
    let cancel = CancellationToken::new();

    let scheduler = Arc::new(Scheduler::new(
        bus.clone(),
        Arc::clone(&registry),
        sessions,
        state,
        config.scheduler.clone(),
        cancel.clone(),
    ));

    Ok(Runtime {
        config,
        bus,
        registry,
        scheduler,
        cancel,
    })
}
