//! Load skills from dirs: each skill is a directory with SKILL.md (YAML frontmatter + markdown).
//! Bullet items under `## Read Endpoints` and `## Write Endpoints` become the skill's endpoint lists.

use anyhow::Result;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const READ_HEADING: &str = "## Read Endpoints";
const WRITE_HEADING: &str = "## Write Endpoints";

/// A loaded skill: name, description, and the endpoints it may read from or write to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub path: PathBuf,
    pub read_endpoints: Vec<String>,
    pub write_endpoints: Vec<String>,
}

/// Frontmatter parsed from SKILL.md (minimal).
#[derive(Debug, Default, Deserialize)]
struct SkillFrontmatter {
    name: Option<String>,
    description: Option<String>,
}

/// Load all skills from the primary root and any extra dirs, skipping disabled names.
/// Precedence: later dirs overwrite earlier ones by name. Result is sorted by name.
pub fn load_skills(
    skills_dir: Option<&Path>,
    extra_dirs: &[PathBuf],
    disabled: &[String],
) -> Result<Vec<Skill>> {
    let mut merged: HashMap<String, Skill> = HashMap::new();

    let dirs = skills_dir
        .into_iter()
        .chain(extra_dirs.iter().map(PathBuf::as_path));
    for dir in dirs {
        for s in load_skills_from_dir(dir)? {
            merged.insert(s.name.clone(), s);
        }
    }

    let mut out: Vec<Skill> = merged
        .into_values()
        .filter(|s| !disabled.iter().any(|d| d == &s.name))
        .collect();
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

fn load_skills_from_dir(dir: &Path) -> Result<Vec<Skill>> {
    let mut out = Vec::new();
    let read_dir = match std::fs::read_dir(dir) {
        Ok(d) => d,
        Err(_) => return Ok(out),
    };
    for entry in read_dir.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let skill_md = path.join("SKILL.md");
        let content = match std::fs::read_to_string(&skill_md) {
            Ok(c) => c,
            Err(_) => continue,
        };
        out.push(parse_skill(&content, &path));
    }
    Ok(out)
}

/// Parse one SKILL.md. Name falls back to the directory name.
pub(crate) fn parse_skill(content: &str, path: &Path) -> Skill {
    let mut name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();
    let mut description = String::new();

    if let Some(rest) = content.strip_prefix("---") {
        if let Some(end) = rest.find("---") {
            match serde_yaml::from_str::<SkillFrontmatter>(rest[..end].trim()) {
                Ok(fm) => {
                    if let Some(n) = fm.name.filter(|n| !n.trim().is_empty()) {
                        name = n.trim().to_string();
                    }
                    if let Some(d) = fm.description {
                        description = d.trim().to_string();
                    }
                }
                Err(e) => log::debug!("skill {}: bad frontmatter: {}", path.display(), e),
            }
        }
    }

    let (read_endpoints, write_endpoints) = parse_endpoint_sections(content);
    Skill {
        name,
        description,
        path: path.to_path_buf(),
        read_endpoints,
        write_endpoints,
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Other,
    Read,
    Write,
}

fn parse_endpoint_sections(content: &str) -> (Vec<String>, Vec<String>) {
    let mut read = Vec::new();
    let mut write = Vec::new();
    let mut section = Section::Other;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed == READ_HEADING {
            section = Section::Read;
            continue;
        }
        if trimmed == WRITE_HEADING {
            section = Section::Write;
            continue;
        }
        if line.starts_with("## ") {
            section = Section::Other;
            continue;
        }
        let Some(item) = trimmed.strip_prefix("- ") else {
            continue;
        };
        match section {
            Section::Read => read.push(item.to_string()),
            Section::Write => write.push(item.to_string()),
            Section::Other => {}
        }
    }
    (read, write)
}

/// One summary line per skill, as injected into the agent prompt.
pub fn summarize_skills(skills: &[Skill]) -> String {
    if skills.is_empty() {
        return "No skills available.".to_string();
    }
    skills
        .iter()
        .map(|s| {
            let read = join_or_none(&s.read_endpoints);
            let write = join_or_none(&s.write_endpoints);
            format!("- {}: Read: {}. Write: {}. {}", s.name, read, write, s.description)
                .trim_end()
                .to_string()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.join(", ")
    }
}
