use std::collections::HashMap;
use std::path::Path;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::process::{self, LogSink, RunOptions};
use crate::store::project::ProjectRecord;

/// Start (or restart) the project's long-running process under pm2, named
/// after the project and rooted in the current release. `--update-env`
/// makes a restart of an existing process pick up the new environment.
pub async fn start(
    cfg: &Config,
    project: &ProjectRecord,
    release_dir: &Path,
    env: HashMap<String, String>,
    redact_keys: Vec<String>,
    sink: &LogSink,
    dry_run: bool,
) -> Result<()> {
    let start_command = project.start_command.as_deref().ok_or_else(|| {
        Error::ConfigIncomplete(format!("project '{}' has no startCommand", project.id))
    })?;

    let cwd = release_dir.to_string_lossy().into_owned();
    let opts = RunOptions {
        cwd: None,
        env,
        redact_keys,
    };
    process::run(
        &cfg.pm2_bin,
        &[
            "start",
            "bash",
            "--name",
            &project.id,
            "--cwd",
            &cwd,
            "--update-env",
            "--",
            "-lc",
            start_command,
        ],
        &opts,
        sink,
        dry_run,
    )
    .await?;
    Ok(())
}

/// Restart a supervised process in place, keeping its saved environment.
pub async fn restart(cfg: &Config, project_id: &str, sink: &LogSink, dry_run: bool) -> Result<()> {
    process::run(
        &cfg.pm2_bin,
        &["restart", project_id],
        &RunOptions::default(),
        sink,
        dry_run,
    )
    .await?;
    Ok(())
}
