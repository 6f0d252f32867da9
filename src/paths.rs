//! Application home resolution.
//!
//! Everything krill persists lives under a single directory, `~/.krill` by
//! default, overridable with the `KRILL_HOME` environment variable. Relative
//! override paths are ignored; all returned paths are absolute.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Resolved paths for the entire application.
///
/// Created once at startup and threaded through `Config`.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Application home: `~/.krill`
    pub home: PathBuf,

    /// `config.toml`
    pub config_file: PathBuf,

    /// Credential store (`auth.json`, mode 0600)
    pub auth_file: PathBuf,

    /// Runtime state (`state.json`)
    pub state_file: PathBuf,

    /// Session files, one JSON file per session key
    pub sessions_dir: PathBuf,
}

impl Paths {
    /// Resolve all paths using real environment variables.
    pub fn resolve() -> Result<Self> {
        Self::resolve_with_env(|key| std::env::var(key))
    }

    /// Resolve paths with a custom env var lookup (for testing).
    pub fn resolve_with_env<F>(env_fn: F) -> Result<Self>
    where
        F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
    {
        let home = match env_fn("KRILL_HOME") {
            Ok(val) if Path::new(&val).is_absolute() => PathBuf::from(val),
            _ => {
                let base = directories::BaseDirs::new()
                    .context("Failed to determine the user home directory")?;
                base.home_dir().join(".krill")
            }
        };

        Ok(Self {
            config_file: home.join("config.toml"),
            auth_file: home.join("auth.json"),
            state_file: home.join("state.json"),
            sessions_dir: home.join("sessions"),
            home,
        })
    }

    /// Default workspace directory for an agent.
    ///
    /// The default agent uses `workspace/`; every other agent gets its own
    /// `workspace-<id>/` so their memory files never collide.
    pub fn workspace_for(&self, agent_id: &str) -> PathBuf {
        if agent_id == crate::agent::DEFAULT_AGENT_ID {
            self.home.join("workspace")
        } else {
            self.home.join(format!("workspace-{}", agent_id))
        }
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::resolve().unwrap_or(Self {
            home: PathBuf::from(".krill"),
            config_file: PathBuf::from(".krill/config.toml"),
            auth_file: PathBuf::from(".krill/auth.json"),
            state_file: PathBuf::from(".krill/state.json"),
            sessions_dir: PathBuf::from(".krill/sessions"),
        })
    }
}
