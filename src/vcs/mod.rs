use std::path::Path;

use crate::error::Result;
use crate::process::{self, LogSink, RunOptions};

/// Canonical clone URL: always ends in `.git`.
pub fn normalize_repo_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    if trimmed.ends_with(".git") {
        trimmed.to_string()
    } else {
        format!("{trimmed}.git")
    }
}

/// Clone the branch into `repo_dir`, or fast-forward an existing checkout.
pub async fn sync(
    repo_url: &str,
    branch: &str,
    repo_dir: &Path,
    sink: &LogSink,
    dry_run: bool,
) -> Result<()> {
    let url = normalize_repo_url(repo_url);
    let dest = repo_dir.to_string_lossy().into_owned();

    if !repo_dir.join(".git").exists() {
        let opts = RunOptions::default();
        process::run(
            "git",
            &["clone", "--branch", branch, &url, &dest],
            &opts,
            sink,
            dry_run,
        )
        .await?;
        return Ok(());
    }

    let opts = RunOptions {
        cwd: Some(repo_dir.to_path_buf()),
        ..Default::default()
    };
    process::run("git", &["fetch", "--all", "--prune"], &opts, sink, dry_run).await?;
    process::run("git", &["checkout", branch], &opts, sink, dry_run).await?;
    process::run("git", &["pull", "--ff-only"], &opts, sink, dry_run).await?;
    Ok(())
}

/// One-time shallow clone used when a project is imported.
pub async fn clone_shallow(
    repo_url: &str,
    branch: &str,
    dest: &Path,
    sink: &LogSink,
) -> Result<()> {
    let url = normalize_repo_url(repo_url);
    let dest = dest.to_string_lossy().into_owned();
    process::run(
        "git",
        &["clone", "--depth", "1", "--branch", branch, &url, &dest],
        &RunOptions::default(),
        sink,
        false,
    )
    .await?;
    Ok(())
}

/// Commit SHA of the checked-out HEAD. `None` in dry-run, where nothing was
/// synced.
pub async fn head_commit(repo_dir: &Path, sink: &LogSink, dry_run: bool) -> Result<Option<String>> {
    let opts = RunOptions {
        cwd: Some(repo_dir.to_path_buf()),
        ..Default::default()
    };
    let out = process::run("git", &["rev-parse", "HEAD"], &opts, sink, dry_run).await?;
    if dry_run {
        return Ok(None);
    }
    Ok(Some(out.stdout.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_url_normalization() {
        assert_eq!(
            normalize_repo_url("https://github.com/o/r"),
            "https://github.com/o/r.git"
        );
        assert_eq!(
            normalize_repo_url("https://github.com/o/r.git"),
            "https://github.com/o/r.git"
        );
        assert_eq!(
            normalize_repo_url("https://github.com/o/r/"),
            "https://github.com/o/r.git"
        );
    }
}
