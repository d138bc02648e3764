//! Skill registry.
//!
//! Skills are named prompt-augmenting resources: markdown files whose first
//! line is a short description and whose body is injected into the system
//! prompt when a session activates them. The registry is loaded once at
//! startup and read-only afterwards.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub prompt: String,
}

#[derive(Debug, Default)]
pub struct SkillRegistry {
    skills: HashMap<String, Skill>,
}

impl SkillRegistry {
    /// Load every `<name>.md` under `dir`. A missing directory is an empty
    /// registry, not an error.
    pub fn load_from(dir: &Path) -> Self {
        let mut skills = HashMap::new();

        let Ok(entries) = std::fs::read_dir(dir) else {
            return Self { skills };
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };

            let description = content
                .lines()
                .next()
                .unwrap_or("")
                .trim_start_matches('#')
                .trim()
                .to_string();

            debug!(skill = name, "loaded skill");
            skills.insert(
                name.to_string(),
                Skill {
                    name: name.to_string(),
                    description,
                    prompt: content,
                },
            );
        }

        Self { skills }
    }

    pub fn get(&self, name: &str) -> Option<&Skill> {
        self.skills.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.skills.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    /// Concatenated prompt text for the active skill set. Unknown names are
    /// skipped; order follows the active list.
    pub fn compose(&self, active: &[String]) -> String {
        let mut sections = Vec::new();
        for name in active {
            if let Some(skill) = self.skills.get(name) {
                sections.push(format!("## Skill: {}\n\n{}", skill.name, skill.prompt));
            }
        }
        sections.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_skill(dir: &Path, name: &str, body: &str) {
        std::fs::write(dir.join(format!("{}.md", name)), body).unwrap();
    }

    #[test]
    fn loads_skills_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "rust-review", "# Review Rust code\nBe thorough.");
        write_skill(dir.path(), "git-flow", "# Git workflow\nSmall commits.");
        std::fs::write(dir.path().join("notes.txt"), "not a skill").unwrap();

        let registry = SkillRegistry::load_from(dir.path());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["git-flow", "rust-review"]);
        assert_eq!(
            registry.get("rust-review").unwrap().description,
            "Review Rust code"
        );
    }

    #[test]
    fn missing_directory_is_empty() {
        let registry = SkillRegistry::load_from(Path::new("/nonexistent/skills"));
        assert!(registry.is_empty());
    }

    #[test]
    fn compose_respects_active_order_and_skips_unknown() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "a", "# A\nalpha");
        write_skill(dir.path(), "b", "# B\nbeta");

        let registry = SkillRegistry::load_from(dir.path());
        let composed = registry.compose(&[
            "b".to_string(),
            "missing".to_string(),
            "a".to_string(),
        ]);

        let b_pos = composed.find("Skill: b").unwrap();
        let a_pos = composed.find("Skill: a").unwrap();
        assert!(b_pos < a_pos);
        assert!(!composed.contains("missing"));
    }
}
