use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct RunOptions {
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub redact_keys: Vec<String>,
}

#[derive(Debug)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    fn empty() -> Self {
        Self {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

/// Append-only sink for a deployment log file. Cloneable so stdout and
/// stderr pumps can write concurrently.
#[derive(Clone)]
pub struct LogSink {
    file: Arc<Mutex<tokio::fs::File>>,
}

impl LogSink {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub async fn line(&self, line: &str) -> Result<()> {
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }
}

/// Substitutes `KEY=<token>` with `KEY=[redacted]` for every configured key.
/// Values only ever appear in child output next to their key in this form;
/// bare values without keyword context cannot be scrubbed.
pub struct Redactor {
    rules: Vec<(Regex, String)>,
}

impl Redactor {
    pub fn new(keys: &[String]) -> Self {
        let rules = keys
            .iter()
            .filter(|k| !k.is_empty())
            .map(|key| {
                let pattern = Regex::new(&format!(r"{}=\S+", regex::escape(key)))
                    .expect("escaped key is a valid pattern");
                (pattern, format!("{key}=[redacted]"))
            })
            .collect();
        Self { rules }
    }

    pub fn apply(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (pattern, replacement) in &self.rules {
            out = pattern.replace_all(&out, replacement.as_str()).into_owned();
        }
        out
    }
}

/// Run a program directly (no shell, no argument interpolation). Output is
/// streamed line-by-line through the redactor into the sink and captured.
pub async fn run(
    program: &str,
    args: &[&str],
    opts: &RunOptions,
    sink: &LogSink,
    dry_run: bool,
) -> Result<CommandOutput> {
    let redactor = Redactor::new(&opts.redact_keys);
    let mut cmdline = program.to_string();
    for arg in args {
        cmdline.push(' ');
        cmdline.push_str(arg);
    }
    let safe_cmd = redactor.apply(&cmdline);

    if dry_run {
        sink.line(&format!("[dry-run] $ {safe_cmd}")).await?;
        return Ok(CommandOutput::empty());
    }

    sink.line(&format!("$ {safe_cmd}")).await?;
    debug!(command = %safe_cmd, "spawning");

    let mut command = Command::new(program);
    command
        .args(args)
        .envs(&opts.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = &opts.cwd {
        command.current_dir(cwd);
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn {program}"))?;

    let stdout = child.stdout.take().context("child stdout not captured")?;
    let stderr = child.stderr.take().context("child stderr not captured")?;

    let (stdout, stderr) = tokio::join!(
        pump(stdout, &redactor, sink),
        pump(stderr, &redactor, sink)
    );
    let (stdout, stderr) = (stdout?, stderr?);

    let status = child.wait().await.context("failed to wait for child")?;
    let exit_code = status.code().unwrap_or(-1);

    if !status.success() {
        return Err(Error::CommandFailed {
            code: exit_code,
            safe_cmd,
            stdout,
            stderr,
        });
    }

    Ok(CommandOutput {
        exit_code,
        stdout,
        stderr,
    })
}

/// Run a script through `bash -lc`.
pub async fn run_shell(
    script: &str,
    opts: &RunOptions,
    sink: &LogSink,
    dry_run: bool,
) -> Result<CommandOutput> {
    run("bash", &["-lc", script], opts, sink, dry_run).await
}

async fn pump(
    reader: impl AsyncRead + Unpin,
    redactor: &Redactor,
    sink: &LogSink,
) -> Result<String> {
    let mut lines = BufReader::new(reader).lines();
    let mut captured = String::new();
    while let Some(line) = lines.next_line().await? {
        let line = redactor.apply(&line);
        sink.line(&line).await?;
        captured.push_str(&line);
        captured.push('\n');
    }
    Ok(captured)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn sink_in(dir: &Path) -> (LogSink, PathBuf) {
        let path = dir.join("out.log");
        (LogSink::open(&path).await.unwrap(), path)
    }

    #[test]
    fn redactor_scrubs_key_value_tokens() {
        let redactor = Redactor::new(&["DB_PASSWORD".into(), "API_KEY".into()]);
        let line = "export DB_PASSWORD=hunter2 API_KEY=abc123 USER=joe";
        assert_eq!(
            redactor.apply(line),
            "export DB_PASSWORD=[redacted] API_KEY=[redacted] USER=joe"
        );
    }

    #[test]
    fn redactor_without_keys_is_identity() {
        let redactor = Redactor::new(&[]);
        assert_eq!(redactor.apply("SECRET=visible"), "SECRET=visible");
    }

    #[tokio::test]
    async fn dry_run_logs_without_spawning() {
        let dir = tempdir().unwrap();
        let (sink, path) = sink_in(dir.path()).await;

        let opts = RunOptions::default();
        let out = run("/nonexistent/program", &["--flag"], &opts, &sink, true)
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);

        let log = std::fs::read_to_string(path).unwrap();
        assert!(log.contains("[dry-run] $ /nonexistent/program --flag"));
    }

    #[tokio::test]
    async fn captures_and_redacts_child_output() {
        let dir = tempdir().unwrap();
        let (sink, path) = sink_in(dir.path()).await;

        let opts = RunOptions {
            redact_keys: vec!["TOKEN".into()],
            ..Default::default()
        };
        let out = run("echo", &["TOKEN=sekrit done"], &opts, &sink, false)
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout, "TOKEN=[redacted] done\n");

        let log = std::fs::read_to_string(path).unwrap();
        assert!(log.contains("TOKEN=[redacted] done"));
        assert!(!log.contains("sekrit"));
    }

    #[tokio::test]
    async fn nonzero_exit_becomes_command_failed() {
        let dir = tempdir().unwrap();
        let (sink, _) = sink_in(dir.path()).await;

        let err = run_shell("echo oops >&2; exit 3", &RunOptions::default(), &sink, false)
            .await
            .unwrap_err();
        match err {
            Error::CommandFailed { code, stderr, .. } => {
                assert_eq!(code, 3);
                assert!(stderr.contains("oops"));
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn shell_env_is_visible_to_the_script() {
        let dir = tempdir().unwrap();
        let (sink, _) = sink_in(dir.path()).await;

        let mut env = HashMap::new();
        env.insert("GREETING".to_string(), "hello".to_string());
        let opts = RunOptions {
            env,
            ..Default::default()
        };
        let out = run_shell("echo \"$GREETING world\"", &opts, &sink, false)
            .await
            .unwrap();
        assert_eq!(out.stdout, "hello world\n");
    }
}
