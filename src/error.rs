use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced by the orchestrator. Each kind maps to one HTTP
/// status in the facade; pipeline workers record the message on the failed
/// step and deployment instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("project '{0}' already exists")]
    ProjectExists(String),

    #[error("deploy queue is full")]
    QueueFull,

    #[error("{0}")]
    ConfigIncomplete(String),

    #[error("path '{path}' escapes '{root}'")]
    PathEscape { path: String, root: String },

    #[error("Failed to decrypt secrets: {0}")]
    SecretDecrypt(String),

    #[error("secret env entry '{0}' has no value")]
    SecretMissingValue(String),

    #[error("env entry '{0}' cannot be downgraded from secret to plain")]
    SecretDowngrade(String),

    #[error("command exited with status {code}: {safe_cmd}")]
    CommandFailed {
        code: i32,
        safe_cmd: String,
        stdout: String,
        stderr: String,
    },

    #[error("no previous release to roll back to")]
    NoPrevious,

    #[error("unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Stable kind tag used in JSON error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "ValidationError",
            Error::NotFound(_) => "NotFound",
            Error::ProjectExists(_) => "ProjectExists",
            Error::QueueFull => "QueueFull",
            Error::ConfigIncomplete(_) => "ConfigIncomplete",
            Error::PathEscape { .. } => "PathEscape",
            Error::SecretDecrypt(_) => "SecretDecrypt",
            Error::SecretMissingValue(_) => "SecretMissingValue",
            Error::SecretDowngrade(_) => "SecretDowngrade",
            Error::CommandFailed { .. } => "CommandFailed",
            Error::NoPrevious => "NoPrevious",
            Error::Unauthorized => "Unauthorized",
            Error::Io(_) => "Internal",
            Error::Json(_) => "Internal",
            Error::Other(_) => "Internal",
        }
    }

    /// Render the error with its source chain, one `caused by:` per level.
    pub fn chain(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            out.push_str("\n  caused by: ");
            out.push_str(&err.to_string());
            source = err.source();
        }
        out
    }
}
