use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::config::Config;

/// Filesystem layout for one project:
///
/// ```text
/// <PROJECTS_DIR>/<id>/
///   deploy-config.json
///   repo/
///   releases/<ts>-<sha7>/
///   current -> releases/...
///   previous -> releases/...
///   deployments/<deploymentId>.json
/// <LOGS_DIR>/<id>/<deploymentId>.log
/// ```
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    root: PathBuf,
    logs_root: PathBuf,
    releases_dir_name: String,
}

impl ProjectPaths {
    pub fn new(cfg: &Config, project_id: &str) -> Self {
        Self {
            root: cfg.projects_dir.join(project_id),
            logs_root: cfg.logs_dir.join(project_id),
            releases_dir_name: cfg.releases_dir_name.clone(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repo_dir(&self) -> PathBuf {
        self.root.join("repo")
    }

    pub fn releases_dir(&self) -> PathBuf {
        self.root.join(&self.releases_dir_name)
    }

    pub fn current_link(&self) -> PathBuf {
        self.root.join("current")
    }

    pub fn previous_link(&self) -> PathBuf {
        self.root.join("previous")
    }

    pub fn deployment_log(&self, deployment_id: Uuid) -> PathBuf {
        self.logs_root.join(format!("{deployment_id}.log"))
    }

    pub fn import_log(&self) -> PathBuf {
        self.logs_root.join("import.log")
    }

    pub fn rollback_log(&self) -> PathBuf {
        self.logs_root.join("rollback.log")
    }
}
