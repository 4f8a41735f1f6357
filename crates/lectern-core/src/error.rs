use std::io;
use thiserror::Error;

/// Central error type for the lectern HTTP engine.
#[derive(Debug, Error)]
pub enum LecternError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A configuration value was rejected before any resource was created.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A worker thread failed fatally (listener or event queue failure).
    #[error("worker {id} failed: {message}")]
    Worker { id: usize, message: String },
}

impl LecternError {
    /// Returns true for errno values that callers retry or park on (`EINTR`, `EAGAIN`).
    pub fn is_transient(&self) -> bool {
        match self {
            LecternError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

pub type LecternResult<T> = Result<T, LecternError>;
