//! Project documents: named patterns stored as JSON.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::pattern::Pattern;

#[derive(Error, Debug)]
pub enum ProjectError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid project document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no pattern named '{0}'")]
    UnknownPattern(String),

    #[error("pattern '{0}' is defined more than once")]
    DuplicatePattern(String),
}

/// A set of named patterns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub patterns: Vec<Pattern>,
}

impl Project {
    /// Loads a project from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ProjectError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ProjectError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    /// Parses a project document.
    pub fn from_json(json: &str) -> Result<Self, ProjectError> {
        let project: Project = serde_json::from_str(json)?;
        for (i, pattern) in project.patterns.iter().enumerate() {
            if project.patterns[..i].iter().any(|p| p.name == pattern.name) {
                return Err(ProjectError::DuplicatePattern(pattern.name.clone()));
            }
        }
        Ok(project)
    }

    /// Looks up a pattern by name.
    pub fn pattern(&self, name: &str) -> Result<&Pattern, ProjectError> {
        self.patterns
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| ProjectError::UnknownPattern(name.to_string()))
    }

    /// Pattern names in document order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|p| p.name.as_str())
    }

    /// Writes the project as pretty-printed JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ProjectError> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ProjectError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledrig_hw::{Color, Command};
    use std::time::Duration;

    const DOCUMENT: &str = r#"{
        "patterns": [
            {
                "name": "alert",
                "loop": true,
                "steps": [
                    {"command": {"type": "fill", "color": [255, 0, 0]}, "hold_ms": 100},
                    {"command": {"type": "clear"}, "hold_ms": 100}
                ]
            },
            {
                "name": "marker",
                "steps": [
                    {"command": {"type": "set_pixel", "index": 5, "color": [0, 255, 0]}, "hold_ms": 0}
                ]
            }
        ]
    }"#;

    #[test]
    fn test_parse_document() {
        let project = Project::from_json(DOCUMENT).unwrap();
        assert_eq!(project.names().collect::<Vec<_>>(), vec!["alert", "marker"]);

        let alert = project.pattern("alert").unwrap();
        assert!(alert.looping);
        assert_eq!(alert.steps[0].command, Command::Fill { color: Color::RED });
        assert_eq!(alert.steps[1].hold(), Duration::from_millis(100));

        let marker = project.pattern("marker").unwrap();
        assert!(!marker.looping);
    }

    #[test]
    fn test_unknown_pattern() {
        let project = Project::from_json(DOCUMENT).unwrap();
        assert!(matches!(
            project.pattern("missing"),
            Err(ProjectError::UnknownPattern(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let json = r#"{"patterns":[
            {"name":"a","steps":[]},
            {"name":"a","steps":[]}
        ]}"#;
        assert!(matches!(
            Project::from_json(json),
            Err(ProjectError::DuplicatePattern(_))
        ));
    }

    #[test]
    fn test_malformed_document() {
        let json = r#"{"patterns":[{"name":"x","steps":[{"command":{"type":"explode"},"hold_ms":1}]}]}"#;
        assert!(matches!(Project::from_json(json), Err(ProjectError::Parse(_))));
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("ledrig-project-{}.json", std::process::id()));
        let project = Project {
            patterns: vec![Pattern::blink(Color::WHITE, 1.0)],
        };
        project.save(&path).unwrap();
        let loaded = Project::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, project);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Project::load("/nonexistent/ledrig.json").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/ledrig.json"));
    }
}
