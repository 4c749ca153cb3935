//! Error types for the file watcher.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for watcher operations.
pub type Result<T> = std::result::Result<T, WatchError>;

/// Errors that can occur in the file watcher.
#[derive(Error, Debug)]
pub enum WatchError {
    /// No directory watch can be attached for this path.
    #[error("cannot watch {}: {reason}", path.display())]
    PathUnwatchable { path: PathBuf, reason: String },

    /// The kernel refused to install a watch.
    #[error("failed to install watch on {}: {reason}", path.display())]
    WatchInstallationFailed { path: PathBuf, reason: String },

    /// The dispatcher stopped after an event source failure.
    #[error("watcher degraded: {0}")]
    Degraded(String),

    /// Notify error.
    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl WatchError {
    pub(crate) fn unwatchable(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::PathUnwatchable {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn installation(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::WatchInstallationFailed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
