//! Storage error type.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the lock-guarded file layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Could not take the advisory lock within the deadline.
    #[error("lock acquisition timed out: {0}")]
    LockTimeout(PathBuf),

    /// Underlying filesystem failure.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File content could not be parsed.
    #[error("parse error in {path}: {message}")]
    Parse { path: PathBuf, message: String },

    /// A record the caller expected was not present.
    #[error("record not found: {0}")]
    NotFound(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn parse(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::Parse {
            path: path.into(),
            message: message.to_string(),
        }
    }
}
