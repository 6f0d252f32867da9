//! Workspace skills.
//!
//! A skill is a `skills/<name>/SKILL.md` file with YAML frontmatter. Only the
//! name and one-line description enter the system prompt; the model is told
//! to read the full SKILL.md on demand.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct SkillFrontmatter {
    name: Option<String>,
    description: Option<String>,
}

/// Load all skills installed in a workspace, sorted by name.
pub fn load_skills(workspace: &Path) -> Vec<Skill> {
    let skills_dir = workspace.join("skills");
    let Ok(entries) = fs::read_dir(&skills_dir) else {
        return Vec::new();
    };

    let mut skills = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let skill_file = dir.join("SKILL.md");
        let Ok(content) = fs::read_to_string(&skill_file) else {
            continue;
        };

        let frontmatter = parse_frontmatter(&content);
        let dir_name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        skills.push(Skill {
            name: frontmatter.name.unwrap_or(dir_name),
            description: frontmatter
                .description
                .unwrap_or_else(|| "No description".to_string()),
            path: skill_file,
        });
    }

    skills.sort_by(|a, b| a.name.cmp(&b.name));
    debug!("Loaded {} skills from {}", skills.len(), skills_dir.display());
    skills
}

/// Keep only allowed skills; an empty filter allows everything.
pub fn filter_skills(skills: Vec<Skill>, allow: &[String]) -> Vec<Skill> {
    if allow.is_empty() {
        return skills;
    }
    skills
        .into_iter()
        .filter(|s| allow.iter().any(|a| a == &s.name))
        .collect()
}

/// Render the skills section of the system prompt; empty when no skills.
pub fn skills_prompt(skills: &[Skill]) -> String {
    if skills.is_empty() {
        return String::new();
    }

    let mut lines = vec![
        "## Skills".to_string(),
        "Installed skills (name: what it does). To use one, read its full \
         instructions with the file-read tool first:"
            .to_string(),
    ];
    for skill in skills {
        lines.push(format!(
            "- {}: {} ({})",
            skill.name,
            skill.description,
            skill.path.display()
        ));
    }
    lines.join("\n")
}

fn parse_frontmatter(content: &str) -> SkillFrontmatter {
    let mut lines = content.lines();
    if lines.next().map(str::trim) != Some("---") {
        return SkillFrontmatter::default();
    }

    let yaml: String = lines
        .take_while(|line| line.trim() != "---")
        .collect::<Vec<_>>()
        .join("\n");

    serde_yaml::from_str(&yaml).unwrap_or_default()
}
