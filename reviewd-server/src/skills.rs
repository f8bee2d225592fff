//! The on-disk skills catalog.
//!
//! Predefined skills live under `<root>/predefined/<category>/<id>.md`
//! and are loaded eagerly at startup; a file's display name is its
//! first `## ` heading. Custom skills are free-form per-repo text
//! stored on the repository row.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

/// The fixed category set, in render order.
pub const CATEGORIES: [&str; 5] = ["languages", "frameworks", "patterns", "testing", "infra"];

#[derive(Debug, Clone)]
pub struct Skill {
    pub category: String,
    pub id: String,
    pub name: String,
    pub content: String,
}

/// All predefined skills, loaded once and cached for the process
/// lifetime.
#[derive(Debug, Clone, Default)]
pub struct SkillsCatalog {
    skills: Vec<Skill>,
}

/// Display name: the first `## ` heading, or the file stem.
fn display_name(content: &str, fallback: &str) -> String {
    content
        .lines()
        .find_map(|l| l.strip_prefix("## "))
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| fallback.to_string())
}

impl SkillsCatalog {
    /// Load the catalog from disk. Missing category directories are
    /// fine; an unreadable root is not.
    pub fn load(root: &Path) -> Result<Self> {
        let predefined = root.join("predefined");
        if !predefined.exists() {
            warn!(
                "Skills directory {} does not exist; reviews run without predefined skills",
                predefined.display()
            );
            return Ok(Self::default());
        }

        let mut skills = Vec::new();
        for category in CATEGORIES {
            let dir = predefined.join(category);
            if !dir.is_dir() {
                continue;
            }
            let mut entries: Vec<_> = fs::read_dir(&dir)
                .with_context(|| format!("Failed to read skills directory {}", dir.display()))?
                .collect::<std::io::Result<Vec<_>>>()
                .with_context(|| format!("Failed to list skills directory {}", dir.display()))?;
            entries.sort_by_key(|e| e.file_name());

            for entry in entries {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("md") {
                    continue;
                }
                let id = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or_default()
                    .to_string();
                let content = fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read skill {}", path.display()))?;
                let name = display_name(&content, &id);
                skills.push(Skill {
                    category: category.to_string(),
                    id,
                    name,
                    content,
                });
            }
        }

        info!("Loaded {} predefined skills", skills.len());
        Ok(Self { skills })
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    /// Render all predefined skills grouped by category for the review
    /// prompt.
    pub fn render_predefined(&self) -> String {
        let mut out = String::new();
        for category in CATEGORIES {
            let in_category: Vec<&Skill> = self
                .skills
                .iter()
                .filter(|s| s.category == category)
                .collect();
            if in_category.is_empty() {
                continue;
            }
            out.push_str(&format!("### {}\n\n", category));
            for skill in in_category {
                out.push_str(&skill.content);
                if !skill.content.ends_with('\n') {
                    out.push('\n');
                }
                out.push('\n');
            }
        }
        out.trim_end().to_string()
    }
}

/// Render a repo's custom skills for the review prompt.
pub fn render_custom(skills: &[String]) -> String {
    skills
        .iter()
        .enumerate()
        .map(|(i, s)| format!("### Custom rule {}\n\n{}", i + 1, s))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_skill(root: &Path, category: &str, id: &str, content: &str) {
        let dir = root.join("predefined").join(category);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(format!("{}.md", id)), content).unwrap();
    }

    #[test]
    fn test_load_and_render_grouped_by_category() {
        let tmp = TempDir::new().unwrap();
        write_skill(
            tmp.path(),
            "languages",
            "rust",
            "## Rust\n\nPrefer `?` over unwrap in library code.\n",
        );
        write_skill(
            tmp.path(),
            "testing",
            "coverage",
            "## Test coverage\n\nNew error paths need tests.\n",
        );

        let catalog = SkillsCatalog::load(tmp.path()).unwrap();
        assert_eq!(catalog.len(), 2);

        let rendered = catalog.render_predefined();
        let languages_pos = rendered.find("### languages").unwrap();
        let testing_pos = rendered.find("### testing").unwrap();
        assert!(languages_pos < testing_pos);
        assert!(rendered.contains("Prefer `?` over unwrap"));
    }

    #[test]
    fn test_display_name_from_heading() {
        let tmp = TempDir::new().unwrap();
        write_skill(tmp.path(), "patterns", "builders", "intro text\n## Builder pattern\nbody");
        write_skill(tmp.path(), "patterns", "naming", "no heading at all");

        let catalog = SkillsCatalog::load(tmp.path()).unwrap();
        let names: Vec<&str> = catalog.skills.iter().map(|s| s.name.as_str()).collect();
        assert!(names.contains(&"Builder pattern"));
        assert!(names.contains(&"naming"));
    }

    #[test]
    fn test_non_markdown_files_ignored() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("predefined").join("infra");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("notes.txt"), "not a skill").unwrap();
        fs::write(dir.join("docker.md"), "## Docker\nPin image digests.").unwrap();

        let catalog = SkillsCatalog::load(tmp.path()).unwrap();
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_missing_root_yields_empty_catalog() {
        let tmp = TempDir::new().unwrap();
        let catalog = SkillsCatalog::load(&tmp.path().join("nope")).unwrap();
        assert!(catalog.is_empty());
        assert_eq!(catalog.render_predefined(), "");
    }

    #[test]
    fn test_render_custom() {
        let rendered = render_custom(&[
            "Never log request bodies.".to_string(),
            "All handlers return typed errors.".to_string(),
        ]);
        assert!(rendered.contains("### Custom rule 1\n\nNever log request bodies."));
        assert!(rendered.contains("### Custom rule 2"));
    }
}
