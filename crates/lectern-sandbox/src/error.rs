use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while provisioning jails or verifying submissions.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A nullfs mount or unmount failed.
    #[error("mount {}: {source}", target.display())]
    Mount {
        target: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Creating, protecting or removing a jail failed.
    #[error("jail {name}: {source}")]
    Jail {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Adding or removing a resource-control rule failed.
    #[error("rctl rule {rule}: {source}")]
    Rctl {
        rule: String,
        #[source]
        source: io::Error,
    },

    #[error("unknown language: {0}")]
    UnknownLanguage(String),

    /// The read-only jail template is missing or unusable.
    #[error("jail template {} is not a directory", .0.display())]
    Template(PathBuf),

    /// The record store failed to load or save a record.
    #[error("record store: {0}")]
    Store(String),

    /// A submission does not line up with the lesson it answers.
    #[error("submission does not match lesson: {0}")]
    Mismatch(String),

    #[error("invalid sandbox configuration: {0}")]
    InvalidConfig(String),

    #[error("verification queue: {0}")]
    Queue(String),
}

impl From<serde_json::Error> for SandboxError {
    fn from(e: serde_json::Error) -> Self {
        SandboxError::InvalidConfig(e.to_string())
    }
}

pub type SandboxResult<T> = Result<T, SandboxError>;
