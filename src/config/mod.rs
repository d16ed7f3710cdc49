use std::path::PathBuf;

use crate::error::{Error, Result};

/// Runtime configuration, read from the environment once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub projects_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub build_dir: PathBuf,
    pub nginx_root: PathBuf,
    pub nginx_sites_available: PathBuf,
    pub nginx_sites_enabled: PathBuf,
    pub pm2_bin: String,
    pub max_concurrent_deploys: usize,
    pub max_queue_size: usize,
    pub secrets_master_key: Option<String>,
    pub default_build_output: String,
    pub releases_dir_name: String,
    pub admin_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from a key lookup. `None` falls back to the default.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            projects_dir: path_var(&get, "PROJECTS_DIR", "/var/deploy/projects"),
            logs_dir: path_var(&get, "LOGS_DIR", "/var/deploy/logs"),
            build_dir: path_var(&get, "BUILD_DIR", "/var/deploy/build"),
            nginx_root: path_var(&get, "NGINX_ROOT", "/var/www"),
            nginx_sites_available: path_var(
                &get,
                "NGINX_SITES_AVAILABLE",
                "/etc/nginx/sites-available",
            ),
            nginx_sites_enabled: path_var(&get, "NGINX_SITES_ENABLED", "/etc/nginx/sites-enabled"),
            pm2_bin: string_var(&get, "PM2_BIN", "pm2"),
            max_concurrent_deploys: usize_var(&get, "MAX_CONCURRENT_DEPLOYS", 1)?.max(1),
            max_queue_size: usize_var(&get, "MAX_QUEUE_SIZE", 50)?.max(1),
            secrets_master_key: get("SECRETS_MASTER_KEY").filter(|v| !v.is_empty()),
            default_build_output: string_var(&get, "DEFAULT_BUILD_OUTPUT", "build"),
            releases_dir_name: string_var(&get, "RELEASES_DIR_NAME", "releases"),
            admin_token: get("ADMIN_TOKEN").filter(|v| !v.is_empty()),
        })
    }

    /// Create the working directories this process owns. The nginx
    /// directories belong to the host and are not touched here.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.projects_dir, &self.logs_dir, &self.build_dir] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

fn string_var(get: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    get(key).filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn path_var(get: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> PathBuf {
    PathBuf::from(string_var(get, key, default))
}

fn usize_var(get: &impl Fn(&str) -> Option<String>, key: &str, default: usize) -> Result<usize> {
    match get(key).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::Validation(format!("{key} must be a positive integer, got '{raw}'"))),
    }
}
