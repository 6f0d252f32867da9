//! Per-workspace long-term memory.
//!
//! Two surfaces: a key→value profile (`memory/profile.json`) for durable
//! facts, and append-only daily notes (`memory/YYYYMM/YYYYMMDD.md`) for the
//! running log. Both render into one markdown block for the system prompt.

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Profile key that receives the content of a migrated legacy `USER.md`.
pub const LEGACY_USER_KEY: &str = "legacy.user_md";

pub struct MemoryStore {
    workspace: PathBuf,
    profile_lock: Mutex<()>,
}

impl MemoryStore {
    pub fn new(workspace: PathBuf) -> Self {
        Self {
            workspace,
            profile_lock: Mutex::new(()),
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    fn memory_dir(&self) -> PathBuf {
        self.workspace.join("memory")
    }

    fn profile_path(&self) -> PathBuf {
        self.memory_dir().join("profile.json")
    }

    /// Read the profile. Missing or corrupt files read as empty; corruption
    /// only surfaces as an error when a write is attempted.
    pub fn read_profile(&self) -> BTreeMap<String, String> {
        self.read_profile_strict().unwrap_or_default()
    }

    fn read_profile_strict(&self) -> Result<BTreeMap<String, String>> {
        let path = self.profile_path();
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = fs::read_to_string(&path)?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Corrupt memory profile {}", path.display()))
    }

    pub fn write_profile_key(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.profile_lock.lock().expect("profile lock poisoned");
        let mut profile = self.read_profile_strict()?;
        profile.insert(key.to_string(), value.to_string());
        self.save_profile(&profile)
    }

    pub fn delete_profile_key(&self, key: &str) -> Result<()> {
        let _guard = self.profile_lock.lock().expect("profile lock poisoned");
        let mut profile = self.read_profile_strict()?;
        profile.remove(key);
        self.save_profile(&profile)
    }

    fn save_profile(&self, profile: &BTreeMap<String, String>) -> Result<()> {
        let path = self.profile_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(profile)?;
        let tmp_path = path.with_extension(format!(
            "{}.{}.tmp",
            std::process::id(),
            uuid::Uuid::new_v4().as_simple()
        ));
        fs::write(&tmp_path, &content)?;
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("Failed to persist {}", path.display()))?;

        debug!("Saved memory profile ({} keys)", profile.len());
        Ok(())
    }

    /// Append a note to today's daily file, creating it with a date header
    /// on the first write of the day.
    pub fn append_today(&self, text: &str) -> Result<()> {
        let now = Local::now();
        let dir = self.memory_dir().join(now.format("%Y%m").to_string());
        fs::create_dir_all(&dir)?;

        let path = dir.join(format!("{}.md", now.format("%Y%m%d")));
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        if file.metadata()?.len() == 0 {
            writeln!(file, "# {}\n", now.format("%Y-%m-%d"))?;
        }
        writeln!(file, "{}", text.trim_end())?;

        debug!("Appended daily note to {}", path.display());
        Ok(())
    }

    /// The most recent `days` daily files, oldest first, joined with `---`.
    pub fn get_recent_daily_notes(&self, days: usize) -> String {
        let mut dated: Vec<(NaiveDate, PathBuf)> = Vec::new();

        let month_dirs = match fs::read_dir(self.memory_dir()) {
            Ok(entries) => entries,
            Err(_) => return String::new(),
        };
        for month in month_dirs.filter_map(|e| e.ok()) {
            let month_path = month.path();
            if !month_path.is_dir() {
                continue;
            }
            let Ok(files) = fs::read_dir(&month_path) else {
                continue;
            };
            for file in files.filter_map(|e| e.ok()) {
                let path = file.path();
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                if let Ok(date) = NaiveDate::parse_from_str(stem, "%Y%m%d") {
                    dated.push((date, path));
                }
            }
        }

        dated.sort_by_key(|(date, _)| *date);
        let recent = dated.split_off(dated.len().saturating_sub(days));

        recent
            .iter()
            .filter_map(|(_, path)| fs::read_to_string(path).ok())
            .map(|s| s.trim().to_string())
            .collect::<Vec<_>>()
            .join("\n\n---\n\n")
    }

    /// Render profile and recent notes as one markdown block for the system
    /// prompt. Empty when there is nothing to show.
    pub fn get_memory_context(&self) -> String {
        let mut sections = Vec::new();

        let profile = self.read_profile();
        if !profile.is_empty() {
            let mut block = String::from("## Long-term Memory\n\n");
            for (key, value) in &profile {
                block.push_str(&format!("- {}: {}\n", key, value));
            }
            sections.push(block.trim_end().to_string());
        }

        let notes = self.get_recent_daily_notes(2);
        if !notes.is_empty() {
            sections.push(format!("## Recent Daily Notes\n\n{}", notes));
        }

        sections.join("\n\n")
    }

    /// One-shot migration of a legacy `USER.md`: its content moves into the
    /// profile under [`LEGACY_USER_KEY`] and the file is renamed to
    /// `USER.md.bak` so it is never migrated twice.
    pub fn migrate_legacy_user_file(&self) -> Result<bool> {
        let user_path = self.workspace.join("USER.md");
        if !user_path.exists() {
            return Ok(false);
        }

        let content = fs::read_to_string(&user_path)?;
        if !content.trim().is_empty() {
            self.write_profile_key(LEGACY_USER_KEY, content.trim())?;
        }

        let backup = self.workspace.join("USER.md.bak");
        if let Err(e) = fs::rename(&user_path, &backup) {
            warn!("Failed to rename USER.md after migration: {}", e);
        } else {
            info!("Migrated USER.md into the memory profile");
        }
        Ok(true)
    }
}
