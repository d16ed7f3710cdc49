use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::secrets::SecretsCodec;

/// Owner id of the privileged operator account. Projects owned by anyone
/// else must reference a command template and cannot run arbitrary commands.
pub const ADMIN_OWNER_ID: &str = "admin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    Static,
    Node,
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Runtime::Static => write!(f, "static"),
            Runtime::Node => write!(f, "node"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Target {
    Server,
    GithubPages,
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvEntry {
    pub key: String,
    #[serde(default)]
    pub is_secret: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_value: Option<String>,
}

/// Env list that tolerates the legacy on-disk map form (`{"KEY": "value"}`)
/// and coerces non-string values to strings on read. Entries without a key
/// are dropped.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EnvList(pub Vec<EnvEntry>);

impl<'de> Deserialize<'de> for EnvList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(EnvList(normalize_env(&value)))
    }
}

fn normalize_env(value: &serde_json::Value) -> Vec<EnvEntry> {
    match value {
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                let obj = item.as_object()?;
                let key = obj.get("key")?.as_str()?.trim().to_string();
                if key.is_empty() {
                    return None;
                }
                Some(EnvEntry {
                    key,
                    is_secret: obj.get("isSecret").and_then(|v| v.as_bool()).unwrap_or(false),
                    value: obj.get("value").and_then(coerce_string),
                    encrypted_value: obj
                        .get("encryptedValue")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                })
            })
            .collect(),
        serde_json::Value::Object(map) => map
            .iter()
            .filter(|(key, _)| !key.trim().is_empty())
            .map(|(key, value)| EnvEntry {
                key: key.trim().to_string(),
                is_secret: false,
                value: coerce_string(value),
                encrypted_value: None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn coerce_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRecord {
    pub id: String,
    pub repo: String,
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_command: Option<String>,
    pub build_output: String,
    pub runtime: Runtime,
    pub deploy_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub target: Target,
    pub owner_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default)]
    pub env: EnvList,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_deploy: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_commit: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ProjectRecord {
    /// Non-admin projects take their commands from a template, never from
    /// the record itself.
    pub fn is_template_bound(&self) -> bool {
        self.owner_id != ADMIN_OWNER_ID
    }

    /// Copy safe to serialize back out through the API: secret entries keep
    /// only their key and flag.
    pub fn public_view(&self) -> ProjectRecord {
        let mut view = self.clone();
        for entry in &mut view.env.0 {
            if entry.is_secret {
                entry.value = None;
                entry.encrypted_value = None;
            }
        }
        view
    }
}

/// Incoming env entry on import or partial update. A secret entry may carry
/// a new cleartext `value` (encrypted on write) or round-trip the stored
/// `encryptedValue`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvEntryUpdate {
    pub key: String,
    #[serde(default)]
    pub is_secret: bool,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub encrypted_value: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectUpdate {
    pub repo: Option<String>,
    pub branch: Option<String>,
    pub build_command: Option<String>,
    pub install_command: Option<String>,
    pub test_command: Option<String>,
    pub start_command: Option<String>,
    pub build_output: Option<String>,
    pub runtime: Option<Runtime>,
    pub deploy_path: Option<PathBuf>,
    pub domain: Option<String>,
    pub port: Option<u16>,
    pub target: Option<Target>,
    pub template_id: Option<String>,
    pub env: Option<Vec<EnvEntryUpdate>>,
}

/// One directory per project under `PROJECTS_DIR`, with the record at
/// `deploy-config.json` next to `repo/`, `releases/` and `deployments/`.
#[derive(Debug, Clone)]
pub struct ProjectStore {
    dir: PathBuf,
    codec: SecretsCodec,
}

impl ProjectStore {
    pub fn new(dir: PathBuf, codec: SecretsCodec) -> Self {
        Self { dir, codec }
    }

    pub fn project_dir(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    pub fn config_path(&self, id: &str) -> PathBuf {
        self.project_dir(id).join("deploy-config.json")
    }

    pub fn exists(&self, id: &str) -> bool {
        self.config_path(id).exists()
    }

    pub fn create(&self, record: &ProjectRecord) -> Result<()> {
        if self.exists(&record.id) {
            return Err(Error::ProjectExists(record.id.clone()));
        }
        let root = self.project_dir(&record.id);
        std::fs::create_dir_all(root.join("repo"))?;
        std::fs::create_dir_all(root.join("deployments"))?;
        self.save(record)
    }

    pub fn load(&self, id: &str) -> Result<ProjectRecord> {
        let path = self.config_path(id);
        if !path.exists() {
            return Err(Error::NotFound(format!("project '{id}'")));
        }
        super::read_json(&path)
    }

    pub fn save(&self, record: &ProjectRecord) -> Result<()> {
        super::write_json_atomic(&self.config_path(&record.id), record)
    }

    /// All readable project records. Entries that fail to parse are skipped
    /// so a hand-edited file cannot take the whole listing down.
    pub fn list(&self) -> Result<Vec<ProjectRecord>> {
        let mut records = Vec::new();
        if !self.dir.exists() {
            return Ok(records);
        }
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let config = entry.path().join("deploy-config.json");
            if !config.exists() {
                continue;
            }
            match super::read_json::<ProjectRecord>(&config) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(path = %config.display(), error = %err, "skipping unreadable project record");
                }
            }
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    /// Apply a partial update and persist. Env updates replace the whole
    /// list and are formatted through [`format_env`].
    pub fn apply_update(&self, id: &str, update: &ProjectUpdate) -> Result<ProjectRecord> {
        let mut record = self.load(id)?;

        if let Some(repo) = &update.repo {
            record.repo = repo.clone();
        }
        if let Some(branch) = &update.branch {
            record.branch = branch.clone();
        }
        if let Some(cmd) = &update.build_command {
            record.build_command = Some(cmd.clone());
        }
        if let Some(cmd) = &update.install_command {
            record.install_command = Some(cmd.clone());
        }
        if let Some(cmd) = &update.test_command {
            record.test_command = Some(cmd.clone());
        }
        if let Some(cmd) = &update.start_command {
            record.start_command = Some(cmd.clone());
        }
        if let Some(output) = &update.build_output {
            record.build_output = output.clone();
        }
        if let Some(runtime) = update.runtime {
            record.runtime = runtime;
        }
        if let Some(path) = &update.deploy_path {
            record.deploy_path = path.clone();
        }
        if let Some(domain) = &update.domain {
            record.domain = Some(domain.clone());
        }
        if let Some(port) = update.port {
            record.port = Some(port);
        }
        if let Some(target) = update.target {
            record.target = target;
        }
        if let Some(template_id) = &update.template_id {
            record.template_id = Some(template_id.clone());
        }
        if let Some(env) = &update.env {
            record.env = format_env(&record.env, env, &self.codec)?;
        }

        self.save(&record)?;
        Ok(record)
    }

    pub fn repo_dir(&self, id: &str) -> PathBuf {
        self.project_dir(id).join("repo")
    }

    pub fn root(&self) -> &Path {
        &self.dir
    }

    pub fn codec(&self) -> &SecretsCodec {
        &self.codec
    }
}

/// Format an incoming env list for storage: encrypt fresh secret values,
/// reuse stored blobs for secrets submitted without a value, keep plain
/// values as-is.
pub fn format_env(
    existing: &EnvList,
    incoming: &[EnvEntryUpdate],
    codec: &SecretsCodec,
) -> Result<EnvList> {
    let mut entries = Vec::with_capacity(incoming.len());
    for update in incoming {
        let key = update.key.trim();
        if key.is_empty() {
            continue;
        }

        if update.is_secret {
            let encrypted = if let Some(value) = &update.value {
                codec.encrypt(value)?
            } else if let Some(blob) = &update.encrypted_value {
                blob.clone()
            } else if let Some(stored) = existing
                .0
                .iter()
                .find(|e| e.key == key && e.encrypted_value.is_some())
            {
                stored.encrypted_value.clone().expect("matched on presence")
            } else {
                return Err(Error::SecretMissingValue(key.to_string()));
            };
            entries.push(EnvEntry {
                key: key.to_string(),
                is_secret: true,
                value: None,
                encrypted_value: Some(encrypted),
            });
        } else {
            entries.push(EnvEntry {
                key: key.to_string(),
                is_secret: false,
                value: update.value.clone(),
                encrypted_value: None,
            });
        }
    }
    Ok(EnvList(entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn record(id: &str) -> ProjectRecord {
        ProjectRecord {
            id: id.into(),
            repo: "https://github.com/o/r".into(),
            branch: "main".into(),
            build_command: Some("npm run build".into()),
            install_command: None,
            test_command: None,
            start_command: None,
            build_output: "build".into(),
            runtime: Runtime::Static,
            deploy_path: PathBuf::from("/var/www/site"),
            domain: None,
            port: None,
            target: Target::Server,
            owner_id: ADMIN_OWNER_ID.into(),
            template_id: None,
            env: EnvList::default(),
            runtime_port: None,
            last_deploy: None,
            last_commit: None,
            created_at: Utc::now(),
        }
    }

    fn store(dir: &Path) -> ProjectStore {
        ProjectStore::new(dir.to_path_buf(), SecretsCodec::new(Some("master")))
    }

    #[test]
    fn create_load_roundtrip_and_duplicate_rejection() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        store.create(&record("site")).unwrap();
        assert!(store.project_dir("site").join("repo").is_dir());

        let loaded = store.load("site").unwrap();
        assert_eq!(loaded.repo, "https://github.com/o/r");

        assert!(matches!(
            store.create(&record("site")),
            Err(Error::ProjectExists(_))
        ));
        assert!(matches!(store.load("ghost"), Err(Error::NotFound(_))));
    }

    #[test]
    fn list_skips_unparseable_records() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.create(&record("good")).unwrap();

        std::fs::create_dir_all(dir.path().join("broken")).unwrap();
        std::fs::write(dir.path().join("broken/deploy-config.json"), "{ nope").unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "good");
    }

    #[test]
    fn legacy_env_map_is_normalized_to_entries() {
        let raw = serde_json::json!({
            "NODE_ENV": "production",
            "WORKERS": 4,
            "DEBUG": false,
            "": "dropped"
        });
        let list: EnvList = serde_json::from_value(raw).unwrap();
        let mut keys: Vec<&str> = list.0.iter().map(|e| e.key.as_str()).collect();
        keys.sort();
        assert_eq!(keys, vec!["DEBUG", "NODE_ENV", "WORKERS"]);

        let workers = list.0.iter().find(|e| e.key == "WORKERS").unwrap();
        assert_eq!(workers.value.as_deref(), Some("4"));
        assert!(!workers.is_secret);
    }

    #[test]
    fn entry_list_env_drops_keyless_entries() {
        let raw = serde_json::json!([
            {"key": "A", "value": "1"},
            {"value": "no key"},
            {"key": "S", "isSecret": true, "encryptedValue": "blob"}
        ]);
        let list: EnvList = serde_json::from_value(raw).unwrap();
        assert_eq!(list.0.len(), 2);
        assert!(list.0[1].is_secret);
        assert_eq!(list.0[1].encrypted_value.as_deref(), Some("blob"));
    }

    #[test]
    fn format_env_encrypts_new_secret_values() {
        let codec = SecretsCodec::new(Some("master"));
        let incoming = vec![EnvEntryUpdate {
            key: "DB_PASSWORD".into(),
            is_secret: true,
            value: Some("hunter2".into()),
            encrypted_value: None,
        }];

        let formatted = format_env(&EnvList::default(), &incoming, &codec).unwrap();
        let entry = &formatted.0[0];
        assert!(entry.is_secret);
        assert!(entry.value.is_none());
        let blob = entry.encrypted_value.as_ref().unwrap();
        assert_eq!(codec.decrypt(blob).unwrap(), "hunter2");
    }

    #[test]
    fn format_env_reuses_stored_blob_when_no_value_given() {
        let codec = SecretsCodec::new(Some("master"));
        let blob = codec.encrypt("stored").unwrap();
        let existing = EnvList(vec![EnvEntry {
            key: "TOKEN".into(),
            is_secret: true,
            value: None,
            encrypted_value: Some(blob.clone()),
        }]);
        let incoming = vec![EnvEntryUpdate {
            key: "TOKEN".into(),
            is_secret: true,
            value: None,
            encrypted_value: None,
        }];

        let formatted = format_env(&existing, &incoming, &codec).unwrap();
        assert_eq!(formatted.0[0].encrypted_value.as_deref(), Some(blob.as_str()));
    }

    #[test]
    fn format_env_fails_for_secret_without_any_source() {
        let codec = SecretsCodec::new(Some("master"));
        let incoming = vec![EnvEntryUpdate {
            key: "MISSING".into(),
            is_secret: true,
            value: None,
            encrypted_value: None,
        }];
        assert!(matches!(
            format_env(&EnvList::default(), &incoming, &codec),
            Err(Error::SecretMissingValue(_))
        ));
    }

    #[test]
    fn secrets_stay_secret_across_update_and_reread() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.create(&record("site")).unwrap();

        let update = ProjectUpdate {
            env: Some(vec![EnvEntryUpdate {
                key: "API_KEY".into(),
                is_secret: true,
                value: Some("cleartext".into()),
                encrypted_value: None,
            }]),
            ..Default::default()
        };
        store.apply_update("site", &update).unwrap();

        let reread = store.load("site").unwrap();
        let entry = &reread.env.0[0];
        assert!(entry.is_secret);
        assert!(entry.value.is_none());
        assert!(entry.encrypted_value.is_some());

        let raw = std::fs::read_to_string(store.config_path("site")).unwrap();
        assert!(!raw.contains("cleartext"));
    }

    #[test]
    fn public_view_elides_secret_material() {
        let codec = SecretsCodec::new(Some("master"));
        let mut rec = record("site");
        rec.env = EnvList(vec![
            EnvEntry {
                key: "PLAIN".into(),
                is_secret: false,
                value: Some("shown".into()),
                encrypted_value: None,
            },
            EnvEntry {
                key: "SECRET".into(),
                is_secret: true,
                value: None,
                encrypted_value: Some(codec.encrypt("hidden").unwrap()),
            },
        ]);

        let view = rec.public_view();
        assert_eq!(view.env.0[0].value.as_deref(), Some("shown"));
        assert!(view.env.0[1].encrypted_value.is_none());

        let json = serde_json::to_string(&view).unwrap();
        assert!(!json.contains("encryptedValue"));
    }
}
