use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::error::{Error, Result};

const INDEX_FILE: &str = ".deployments-index.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployStatus {
    Queued,
    Running,
    Success,
    Failed,
}

impl DeployStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DeployStatus::Success | DeployStatus::Failed)
    }
}

/// Pipeline steps in execution order. The `Ord` derive follows declaration
/// order, so a `BTreeMap` keyed by step serializes in pipeline order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Sync,
    Install,
    Test,
    Build,
    Release,
    Nginx,
    Runtime,
}

impl Step {
    pub const ALL: [Step; 7] = [
        Step::Sync,
        Step::Install,
        Step::Test,
        Step::Build,
        Step::Release,
        Step::Nginx,
        Step::Runtime,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Step::Sync => "sync",
            Step::Install => "install",
            Step::Test => "test",
            Step::Build => "build",
            Step::Release => "release",
            Step::Nginx => "nginx",
            Step::Runtime => "runtime",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    pub id: Uuid,
    pub project_id: String,
    pub status: DeployStatus,
    #[serde(default)]
    pub dry_run: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    pub log_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub steps: BTreeMap<Step, StepRecord>,
}

impl DeploymentRecord {
    /// Fresh queued record. The log file lives under the project's log
    /// directory, named after the generated deployment id.
    pub fn new(project_id: &str, dry_run: bool, logs_root: &std::path::Path) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            project_id: project_id.to_string(),
            status: DeployStatus::Queued,
            dry_run,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            commit: None,
            log_path: logs_root.join(format!("{id}.log")),
            error: None,
            steps: BTreeMap::new(),
        }
    }
}

/// Deployment records live under their project
/// (`<project>/deployments/<id>.json`); a process-wide index file maps
/// deployment id to project id so lookups by id stay O(1).
#[derive(Debug)]
pub struct DeploymentStore {
    projects_dir: PathBuf,
    // The index file is read-modify-write; this serializes all access.
    index_lock: Mutex<()>,
}

impl DeploymentStore {
    pub fn new(projects_dir: PathBuf) -> Self {
        Self {
            projects_dir,
            index_lock: Mutex::new(()),
        }
    }

    fn index_path(&self) -> PathBuf {
        self.projects_dir.join(INDEX_FILE)
    }

    fn record_path(&self, project_id: &str, id: Uuid) -> PathBuf {
        self.projects_dir
            .join(project_id)
            .join("deployments")
            .join(format!("{id}.json"))
    }

    fn read_index(&self) -> Result<HashMap<String, String>> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(HashMap::new());
        }
        super::read_json(&path)
    }

    /// Persist a fresh record and register it in the index.
    pub async fn create(&self, record: &DeploymentRecord) -> Result<()> {
        let _guard = self.index_lock.lock().await;
        super::write_json_atomic(&self.record_path(&record.project_id, record.id), record)?;
        let mut index = self.read_index()?;
        index.insert(record.id.to_string(), record.project_id.clone());
        super::write_json_atomic(&self.index_path(), &index)
    }

    /// Persist an update. Records already in a terminal state are immutable.
    pub async fn save(&self, record: &DeploymentRecord) -> Result<()> {
        let path = self.record_path(&record.project_id, record.id);
        if let Ok(existing) = super::read_json::<DeploymentRecord>(&path) {
            if existing.status.is_terminal() {
                return Err(Error::Validation(format!(
                    "deployment {} is already {:?} and cannot change",
                    record.id, existing.status
                )));
            }
        }
        super::write_json_atomic(&path, record)
    }

    pub async fn get(&self, id: Uuid) -> Result<DeploymentRecord> {
        let project_id = {
            let _guard = self.index_lock.lock().await;
            self.read_index()?
                .get(&id.to_string())
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("deployment '{id}'")))?
        };
        let path = self.record_path(&project_id, id);
        if !path.exists() {
            return Err(Error::NotFound(format!("deployment '{id}'")));
        }
        super::read_json(&path)
    }

    /// Deployments for one project, newest first. Unparseable files are
    /// skipped.
    pub fn list_for_project(&self, project_id: &str, limit: usize) -> Result<Vec<DeploymentRecord>> {
        let dir = self.projects_dir.join(project_id).join("deployments");
        let mut records = Vec::new();
        if !dir.exists() {
            return Ok(records);
        }
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            match super::read_json::<DeploymentRecord>(&path) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable deployment record");
                }
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        Ok(records)
    }
}
