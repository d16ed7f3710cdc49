use std::path::{Path, PathBuf};

use anyhow::anyhow;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::nginx;
use crate::pm2;
use crate::process::{self, LogSink, RunOptions};
use crate::release;
use crate::secrets::BuiltEnv;
use crate::store::project::{ProjectRecord, Runtime, Target};
use crate::vcs;

use super::context::ProjectPaths;
use super::ResolvedCommands;

/// Everything a pipeline step needs. The project record is the worker's
/// local copy and already carries the assigned runtime port.
pub struct StepCtx<'a> {
    pub cfg: &'a Config,
    pub paths: &'a ProjectPaths,
    pub project: &'a ProjectRecord,
    pub commands: &'a ResolvedCommands,
    pub env: &'a BuiltEnv,
    pub sink: &'a LogSink,
    pub dry_run: bool,
}

impl StepCtx<'_> {
    fn run_opts(&self) -> RunOptions {
        RunOptions {
            cwd: Some(self.paths.repo_dir()),
            env: self.env.merged(),
            redact_keys: self.env.secret_keys.clone(),
        }
    }
}

pub enum StepOutcome {
    Ran,
    Skipped(&'static str),
}

/// Clone or fast-forward the branch, then resolve the deployed commit.
pub async fn sync(ctx: &StepCtx<'_>) -> Result<Option<String>> {
    vcs::sync(
        &ctx.project.repo,
        &ctx.project.branch,
        &ctx.paths.repo_dir(),
        ctx.sink,
        ctx.dry_run,
    )
    .await?;
    vcs::head_commit(&ctx.paths.repo_dir(), ctx.sink, ctx.dry_run).await
}

/// Install dependencies. Without an explicit command, fall back to npm
/// based on what the checkout contains; skip entirely for non-npm trees.
pub async fn install(ctx: &StepCtx<'_>) -> Result<StepOutcome> {
    let command = match &ctx.commands.install {
        Some(cmd) => Some(cmd.clone()),
        None => detect_install(&ctx.paths.repo_dir()),
    };
    match command {
        Some(cmd) => {
            process::run_shell(&cmd, &ctx.run_opts(), ctx.sink, ctx.dry_run).await?;
            Ok(StepOutcome::Ran)
        }
        None => Ok(StepOutcome::Skipped("no install command")),
    }
}

fn detect_install(repo_dir: &Path) -> Option<String> {
    if repo_dir.join("package-lock.json").exists() {
        Some("npm ci".to_string())
    } else if repo_dir.join("package.json").exists() {
        Some("npm install --production".to_string())
    } else {
        None
    }
}

pub async fn test(ctx: &StepCtx<'_>) -> Result<StepOutcome> {
    match &ctx.commands.test {
        Some(cmd) => {
            process::run_shell(cmd, &ctx.run_opts(), ctx.sink, ctx.dry_run).await?;
            Ok(StepOutcome::Ran)
        }
        None => Ok(StepOutcome::Skipped("no test command")),
    }
}

pub async fn build(ctx: &StepCtx<'_>) -> Result<()> {
    let cmd = ctx.commands.build.as_deref().ok_or_else(|| {
        Error::ConfigIncomplete(format!("project '{}' has no build command", ctx.project.id))
    })?;
    process::run_shell(cmd, &ctx.run_opts(), ctx.sink, ctx.dry_run).await?;
    Ok(())
}

/// Publish the build output as an immutable release and flip the live
/// symlinks. The promotion itself runs under the per-project lock.
pub async fn release(
    ctx: &StepCtx<'_>,
    commit: Option<&str>,
    promotion: &Mutex<()>,
) -> Result<Option<PathBuf>> {
    if ctx.dry_run {
        ctx.sink
            .line(&format!(
                "[dry-run] would publish '{}' as a new release and point current, previous and {} at it",
                ctx.project.build_output,
                ctx.project.deploy_path.display()
            ))
            .await?;
        return Ok(None);
    }

    let commit = commit.ok_or_else(|| anyhow!("no commit recorded by the sync step"))?;
    let name = release::release_name(commit);
    let release_dir = release::publish(
        &ctx.paths.repo_dir(),
        &ctx.project.build_output,
        &ctx.paths.releases_dir(),
        &name,
    )?;

    {
        let _guard = promotion.lock().await;
        release::promote(
            &release_dir,
            &ctx.paths.current_link(),
            &ctx.paths.previous_link(),
            &ctx.project.deploy_path,
            &ctx.cfg.nginx_root,
        )?;
    }

    ctx.sink.line(&format!("release {name} is live")).await?;
    Ok(Some(release_dir))
}

/// Render and enable the server block, then test and reload nginx.
/// Projects published elsewhere have nothing to serve from this host.
pub async fn nginx(ctx: &StepCtx<'_>) -> Result<StepOutcome> {
    if ctx.project.target == Target::GithubPages {
        return Ok(StepOutcome::Skipped("github-pages target"));
    }
    nginx::install(ctx.cfg, ctx.project, ctx.sink, ctx.dry_run).await?;
    Ok(StepOutcome::Ran)
}

/// Hand long-running apps to the process manager with PORT forced to the
/// assigned runtime port.
pub async fn runtime(ctx: &StepCtx<'_>, release_dir: Option<&Path>) -> Result<StepOutcome> {
    match ctx.project.runtime {
        Runtime::Static => Ok(StepOutcome::Skipped("static runtime")),
        Runtime::Node => {
            let mut env = ctx.env.merged();
            if let Some(port) = ctx.project.runtime_port {
                env.insert("PORT".to_string(), port.to_string());
            }
            // In dry-run no release exists; the current link stands in for
            // the command line that gets logged.
            let cwd = release_dir
                .map(Path::to_path_buf)
                .unwrap_or_else(|| ctx.paths.current_link());
            pm2::start(
                ctx.cfg,
                ctx.project,
                &cwd,
                env,
                ctx.env.secret_keys.clone(),
                ctx.sink,
                ctx.dry_run,
            )
            .await?;
            Ok(StepOutcome::Ran)
        }
    }
}
