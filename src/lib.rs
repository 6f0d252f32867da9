//! krill — a multi-channel personal AI agent runtime.
//!
//! The crate provides the agent scheduling core:
//! - Per-session conversation state with summarization and emergency compression
//! - The bounded LLM-and-tool iteration loop with async completion propagation
//! - Provider adapters behind one `chat` contract, with a typed fallback chain
//! - Multi-agent routing and session-key derivation
//! - Workspace memory (profile + daily notes) and skills

pub mod agent;
pub mod auth;
pub mod bus;
pub mod cli;
pub mod config;
pub mod heartbeat;
pub mod paths;
pub mod protocol;
pub mod providers;
pub mod routing;
pub mod scheduler;
pub mod skills;
pub mod state;
pub mod workspace;

pub use config::Config;
