//! Credential store: `~/.krill/auth.json`.
//!
//! One record per provider. The file is written atomically and kept at mode
//! 0600; writes are serialized through a single lock so concurrent token
//! refreshes cannot clobber each other.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credential {
    #[serde(default)]
    pub access_token: String,

    #[serde(default)]
    pub refresh_token: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,

    /// Unix seconds; 0 means the token never expires.
    #[serde(default)]
    pub expires_at: i64,

    #[serde(default)]
    pub provider: String,

    /// e.g. "api_key", "oauth"
    #[serde(default)]
    pub auth_method: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

impl Credential {
    pub fn api_key(provider: &str, token: &str) -> Self {
        Self {
            access_token: token.to_string(),
            provider: provider.to_string(),
            auth_method: "api_key".to_string(),
            ..Default::default()
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at > 0 && chrono::Utc::now().timestamp() >= self.expires_at
    }
}

pub struct AuthStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl AuthStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    /// Read all credentials. A missing or corrupt file reads as empty.
    pub fn load(&self) -> HashMap<String, Credential> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return HashMap::new(),
        };
        match serde_json::from_str(&raw) {
            Ok(map) => map,
            Err(e) => {
                warn!("Ignoring corrupt auth store {}: {}", self.path.display(), e);
                HashMap::new()
            }
        }
    }

    /// Credential for a provider, skipping expired tokens.
    pub fn get(&self, provider: &str) -> Option<Credential> {
        let cred = self.load().remove(provider)?;
        if cred.is_expired() {
            debug!("Credential for {} is expired", provider);
            return None;
        }
        Some(cred)
    }

    pub fn set(&self, provider: &str, credential: Credential) -> Result<()> {
        let _guard = self.lock.lock().expect("auth store lock poisoned");
        let mut all = self.load();
        all.insert(provider.to_string(), credential);
        self.save(&all)
    }

    pub fn delete(&self, provider: &str) -> Result<()> {
        let _guard = self.lock.lock().expect("auth store lock poisoned");
        let mut all = self.load();
        all.remove(provider);
        self.save(&all)
    }

    fn save(&self, all: &HashMap<String, Credential>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(all)?;
        let tmp_path = self.path.with_extension(format!(
            "{}.{}.tmp",
            std::process::id(),
            uuid::Uuid::new_v4().as_simple()
        ));

        fs::write(&tmp_path, &content)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
        }
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("Failed to persist {}", self.path.display()))?;

        debug!("Saved auth store to {:?}", self.path);
        Ok(())
    }
}
