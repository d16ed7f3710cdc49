use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const CATALOG_FILE: &str = "command-templates.json";

/// A vetted preset of pipeline commands. User-owned projects must reference
/// one; their own command fields are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandTemplate {
    #[serde(default)]
    pub install_command: Option<String>,
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default)]
    pub test_command: Option<String>,
    #[serde(default)]
    pub start_command: Option<String>,
}

/// Read-only catalog, re-read on every lookup so operator edits take effect
/// without a restart.
#[derive(Debug, Clone)]
pub struct TemplateStore {
    path: PathBuf,
}

impl TemplateStore {
    pub fn new(projects_dir: &std::path::Path) -> Self {
        Self {
            path: projects_dir.join(CATALOG_FILE),
        }
    }

    pub fn catalog(&self) -> Result<HashMap<String, CommandTemplate>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        super::read_json(&self.path)
    }

    pub fn get(&self, id: &str) -> Result<CommandTemplate> {
        self.catalog()?
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("command template '{id}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_catalog_is_empty() {
        let dir = tempdir().unwrap();
        let store = TemplateStore::new(dir.path());
        assert!(store.catalog().unwrap().is_empty());
        assert!(matches!(store.get("node-app"), Err(Error::NotFound(_))));
    }

    #[test]
    fn catalog_lookup() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(CATALOG_FILE),
            serde_json::json!({
                "node-app": {
                    "installCommand": "npm ci",
                    "buildCommand": "npm run build",
                    "startCommand": "node server.js"
                }
            })
            .to_string(),
        )
        .unwrap();

        let store = TemplateStore::new(dir.path());
        let template = store.get("node-app").unwrap();
        assert_eq!(template.build_command.as_deref(), Some("npm run build"));
        assert!(template.test_command.is_none());
    }
}
