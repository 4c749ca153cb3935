//! Configuration types for the watch service.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WatchError};

/// Default name of the dispatcher thread.
pub const DEFAULT_THREAD_NAME: &str = "file-watcher";

/// Configuration for a [`WatchService`](crate::WatchService).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Which kernel notification backend to use.
    pub backend: Backend,

    /// Name given to the dispatcher thread.
    pub thread_name: String,

    /// Whether the direct watch on a symbolic link follows it to its target.
    pub follow_symlinks: bool,

    /// Whether identical consecutive raw events in one batch are merged.
    pub coalesce_events: bool,
}

impl WatchConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self {
            backend: Backend::Native,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            follow_symlinks: true,
            coalesce_events: true,
        }
    }

    /// Set the backend.
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Use the polling backend with the given interval.
    pub fn with_polling(mut self, interval: Duration) -> Self {
        self.backend = Backend::Poll {
            poll_interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
        };
        self
    }

    /// Set the dispatcher thread name.
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Watch symbolic links themselves instead of their targets.
    pub fn no_follow_symlinks(mut self) -> Self {
        self.follow_symlinks = false;
        self
    }

    /// Deliver every raw event, even exact repeats within a batch.
    pub fn without_coalescing(mut self) -> Self {
        self.coalesce_events = false;
        self
    }

    /// Parse a config from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the values are usable.
    pub fn validate(&self) -> Result<()> {
        if self.thread_name.trim().is_empty() {
            return Err(WatchError::Config("thread name must not be empty".to_string()));
        }
        if self.thread_name.contains('\0') {
            return Err(WatchError::Config(
                "thread name must not contain NUL bytes".to_string(),
            ));
        }
        if let Backend::Poll { poll_interval_ms } = self.backend {
            if poll_interval_ms == 0 {
                return Err(WatchError::Config(
                    "poll interval must be greater than zero".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Kernel notification backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Backend {
    /// The platform's native mechanism (inotify, FSEvents, ReadDirectoryChangesW, kqueue).
    #[default]
    Native,

    /// Periodic stat-based polling, for filesystems without native support.
    Poll {
        /// Interval between scans in milliseconds.
        poll_interval_ms: u64,
    },
}

impl Backend {
    /// Poll interval, if this is the polling backend.
    pub fn poll_interval(&self) -> Option<Duration> {
        match self {
            Self::Native => None,
            Self::Poll { poll_interval_ms } => Some(Duration::from_millis(*poll_interval_ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_config_builder() {
        let config = WatchConfig::new()
            .with_polling(Duration::from_millis(250))
            .with_thread_name("reload-watcher")
            .no_follow_symlinks();

        assert_eq!(
            config.backend,
            Backend::Poll {
                poll_interval_ms: 250
            }
        );
        assert_eq!(config.backend.poll_interval(), Some(Duration::from_millis(250)));
        assert_eq!(config.thread_name, "reload-watcher");
        assert!(!config.follow_symlinks);
        assert!(config.coalesce_events);
    }

    #[test]
    fn test_config_from_partial_json() {
        let config = WatchConfig::from_json(r#"{"backend":{"kind":"poll","poll_interval_ms":50}}"#)
            .unwrap();

        assert_eq!(config.backend.poll_interval(), Some(Duration::from_millis(50)));
        assert_eq!(config.thread_name, DEFAULT_THREAD_NAME);
        assert!(config.follow_symlinks);
    }

    #[test]
    fn test_config_rejects_zero_interval() {
        let result = WatchConfig::from_json(r#"{"backend":{"kind":"poll","poll_interval_ms":0}}"#);
        assert!(matches!(result, Err(WatchError::Config(_))));

        let config = WatchConfig::new().with_thread_name("  ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_rejects_malformed_json() {
        let result = WatchConfig::from_json("{ not json");
        assert!(matches!(result, Err(WatchError::Serialization(_))));
    }
}
