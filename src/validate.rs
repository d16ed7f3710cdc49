use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};
use crate::store::project::{EnvEntryUpdate, EnvList};

static BRANCH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._/-]{1,128}$").expect("valid pattern"));

static PROJECT_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]{0,63}$").expect("valid pattern"));

pub fn branch(name: &str) -> Result<()> {
    if BRANCH_RE.is_match(name) && !name.contains("..") {
        Ok(())
    } else {
        Err(Error::Validation(format!("invalid branch name '{name}'")))
    }
}

pub fn project_id(id: &str) -> Result<()> {
    if PROJECT_ID_RE.is_match(id) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "invalid project id '{id}' (lowercase letters, digits and dashes)"
        )))
    }
}

pub fn repo_url(url: &str) -> Result<()> {
    if url.starts_with("https://") && url.len() > "https://".len() {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "repository URL must be https, got '{url}'"
        )))
    }
}

/// The deploy path must resolve under the configured web root.
pub fn deploy_path(path: &Path, nginx_root: &Path) -> Result<PathBuf> {
    if !path.is_absolute() {
        return Err(Error::Validation(format!(
            "deployPath must be absolute, got '{}'",
            path.display()
        )));
    }
    let resolved = lexical_normalize(path);
    let root = lexical_normalize(nginx_root);
    if resolved.starts_with(&root) {
        Ok(resolved)
    } else {
        Err(Error::PathEscape {
            path: path.display().to_string(),
            root: nginx_root.display().to_string(),
        })
    }
}

/// The build output, resolved against the repo root, must stay within it.
pub fn build_output(raw: &str, repo_root: &Path) -> Result<()> {
    let candidate = if Path::new(raw).is_absolute() {
        PathBuf::from(raw)
    } else {
        repo_root.join(raw)
    };
    let resolved = lexical_normalize(&candidate);
    let root = lexical_normalize(repo_root);
    if resolved.starts_with(&root) {
        Ok(())
    } else {
        Err(Error::PathEscape {
            path: raw.to_string(),
            root: repo_root.display().to_string(),
        })
    }
}

/// Env updates must have unique keys and may never downgrade a stored
/// secret entry to a plain one.
pub fn env_update(existing: &EnvList, incoming: &[EnvEntryUpdate]) -> Result<()> {
    let mut seen = HashSet::new();
    for entry in incoming {
        let key = entry.key.trim();
        if key.is_empty() {
            continue;
        }
        if !seen.insert(key) {
            return Err(Error::Validation(format!("duplicate env key '{key}'")));
        }
    }

    let secret_keys: HashSet<&str> = existing
        .0
        .iter()
        .filter(|e| e.is_secret)
        .map(|e| e.key.as_str())
        .collect();
    for entry in incoming {
        if !entry.is_secret && secret_keys.contains(entry.key.trim()) {
            return Err(Error::SecretDowngrade(entry.key.trim().to_string()));
        }
    }
    Ok(())
}

/// Collapse `.` and `..` components without touching the filesystem, so
/// prefix checks work for paths that do not exist yet.
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir);
                }
            }
            other => out.push(other),
        }
    }
    out
}
