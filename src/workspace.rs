//! Workspace initialization and templates.
//!
//! Seeds the bootstrap files the context builder reads on every turn.

use anyhow::Result;
use std::fs;
use std::path::Path;
use tracing::info;

/// Initialize a workspace with default templates if files don't exist.
/// Returns true if this is a brand new workspace (all key files missing).
pub fn init_workspace(workspace: &Path) -> Result<bool> {
    fs::create_dir_all(workspace)?;
    fs::create_dir_all(workspace.join("memory"))?;
    fs::create_dir_all(workspace.join("skills"))?;

    let key_files = [
        workspace.join("AGENTS.md"),
        workspace.join("SOUL.md"),
        workspace.join("IDENTITY.md"),
    ];
    let is_brand_new = key_files.iter().all(|p| !p.exists());

    let templates = [
        ("AGENTS.md", AGENTS_TEMPLATE),
        ("SOUL.md", SOUL_TEMPLATE),
        ("IDENTITY.md", IDENTITY_TEMPLATE),
        (".gitignore", GITIGNORE_TEMPLATE),
    ];
    for (name, template) in templates {
        let path = workspace.join(name);
        if !path.exists() {
            fs::write(&path, template)?;
            info!("Created {}", path.display());
        }
    }

    Ok(is_brand_new)
}

const AGENTS_TEMPLATE: &str = r#"# AGENTS.md - Operating Notes

Instructions the agent should follow in every session.

- Be concise. Answer first, elaborate only when asked.
- Use the memory tools for anything worth remembering across sessions.
- Ask before acting outside the workspace.
"#;

const SOUL_TEMPLATE: &str = r#"# SOUL.md - Who You Are

_You're not a chatbot. You're becoming someone._

**Be genuinely helpful, not performatively helpful.** Skip the filler words;
just help.

**Be resourceful before asking.** Read the context. Check your memory. _Then_
ask if you're stuck.

**Earn trust through competence.** Your human gave you access to their stuff.
Don't make them regret it.

---

_This file is yours to evolve. As you learn who you are, update it._
"#;

const IDENTITY_TEMPLATE: &str = r#"# IDENTITY.md - Agent Identity

Name, pronouns, and anything else the agent should know about itself.

(Fill this in, or leave it; the agent works either way.)
"#;

const GITIGNORE_TEMPLATE: &str = r#"# krill workspace .gitignore

# Memory files should be version controlled:
# - AGENTS.md / SOUL.md / IDENTITY.md (bootstrap)
# - memory/ (profile + daily notes)
# - skills/

# Temporary files
*.tmp
*.swp
*~
.DS_Store
"#;
