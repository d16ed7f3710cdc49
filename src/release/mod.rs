use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::validate;

/// Release directory name: epoch millis plus the short commit SHA, so names
/// sort chronologically and identify their commit.
pub fn release_name(commit: &str) -> String {
    let sha7 = &commit[..commit.len().min(7)];
    format!("{}-{}", Utc::now().timestamp_millis(), sha7)
}

/// Copy the build output into a fresh release directory. The output path is
/// resolved against the repo root and must not escape it.
pub fn publish(
    repo_dir: &Path,
    build_output: &str,
    releases_dir: &Path,
    name: &str,
) -> Result<PathBuf> {
    let repo_root = repo_dir
        .canonicalize()
        .with_context(|| format!("repo dir missing: {}", repo_dir.display()))?;

    let candidate = if Path::new(build_output).is_absolute() {
        PathBuf::from(build_output)
    } else {
        repo_root.join(build_output)
    };
    let output = candidate.canonicalize().map_err(|_| {
        Error::Validation(format!(
            "build output '{build_output}' does not exist; did the build produce it?"
        ))
    })?;
    if !output.starts_with(&repo_root) {
        return Err(Error::PathEscape {
            path: build_output.to_string(),
            root: repo_root.display().to_string(),
        });
    }

    let release_dir = releases_dir.join(name);
    std::fs::create_dir_all(&release_dir)?;
    copy_recursive(&output, &release_dir)?;
    Ok(release_dir)
}

/// Flip the live pointers to a freshly published release:
/// `previous` takes over the old `current` target, `current` and the deploy
/// path point at the new release. Callers hold the per-project lock.
pub fn promote(
    release_dir: &Path,
    current: &Path,
    previous: &Path,
    deploy_path: &Path,
    nginx_root: &Path,
) -> Result<()> {
    if current.symlink_metadata().is_ok() {
        let old = std::fs::read_link(current)?;
        replace_symlink(previous, &old)?;
    }
    replace_symlink(current, release_dir)?;

    // The deploy path is operator input; re-verify it here even though the
    // validator checked it at write time.
    let verified = validate::deploy_path(deploy_path, nginx_root)?;
    if let Some(parent) = verified.parent() {
        std::fs::create_dir_all(parent)?;
    }
    replace_symlink(&verified, release_dir)?;
    Ok(())
}

/// Point `current` and the deploy path back at the previous release.
/// Returns the release directory now live.
pub fn rollback_pointers(current: &Path, previous: &Path, deploy_path: &Path) -> Result<PathBuf> {
    let target = match std::fs::read_link(previous) {
        Ok(target) => target,
        Err(_) => return Err(Error::NoPrevious),
    };
    replace_symlink(current, &target)?;
    if let Some(parent) = deploy_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    replace_symlink(deploy_path, &target)?;
    Ok(target)
}

/// Unlink-then-symlink. Not atomic across the two calls, but the link is
/// only ever absent for the instant between them.
fn replace_symlink(link: &Path, target: &Path) -> Result<()> {
    if link.symlink_metadata().is_ok() {
        std::fs::remove_file(link)?;
    }
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

fn copy_recursive(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| Error::Other(e.into()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .context("walked path outside copy root")?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let dest = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(target, &dest)?;
        } else {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}
