//! Per-path watch state.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::source::WatchHandle;

/// Callback invoked when a watched path changes.
pub type Callback = Arc<dyn Fn() + Send + Sync>;

/// Identifies one subscription within a watch service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw id value.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Whether the path currently exists, and its direct watch if so.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryState {
    /// Only the parent directory is watched.
    Absent,

    /// The path exists and has a direct watch.
    Present { direct: WatchHandle },
}

/// Where a path currently leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Resolution {
    /// What the direct watch should be installed on.
    pub target: PathBuf,

    /// Whether `target` exists.
    pub exists: bool,
}

/// All watch state and subscribers for one canonical path.
pub(crate) struct PathEntry {
    path: PathBuf,
    directory: PathBuf,
    name: OsString,
    state: EntryState,
    /// Last resolved target, kept while absent so a returning symlink target
    /// can still be matched.
    target: Option<PathBuf>,
    subscribers: BTreeMap<SubscriptionId, Callback>,
}

impl PathEntry {
    /// New absent entry for `directory/name`.
    pub fn new(directory: PathBuf, name: OsString) -> Self {
        Self {
            path: directory.join(&name),
            directory,
            name,
            state: EntryState::Absent,
            target: None,
            subscribers: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn name(&self) -> &OsStr {
        &self.name
    }

    #[cfg(test)]
    pub fn state(&self) -> EntryState {
        self.state
    }

    pub fn exists(&self) -> bool {
        matches!(self.state, EntryState::Present { .. })
    }

    pub fn direct_watch(&self) -> Option<WatchHandle> {
        match self.state {
            EntryState::Present { direct } => Some(direct),
            EntryState::Absent => None,
        }
    }

    pub fn target(&self) -> Option<&Path> {
        self.target.as_deref()
    }

    pub fn set_target(&mut self, target: Option<PathBuf>) {
        self.target = target;
    }

    /// Absent → Present.
    pub fn mark_present(&mut self, direct: WatchHandle) {
        self.state = EntryState::Present { direct };
    }

    /// Present → Absent, returning the direct watch to tear down.
    pub fn mark_absent(&mut self) -> Option<WatchHandle> {
        let direct = self.direct_watch();
        self.state = EntryState::Absent;
        direct
    }

    pub fn add_subscriber(&mut self, id: SubscriptionId, callback: Callback) {
        self.subscribers.insert(id, callback);
    }

    /// Returns whether the subscriber was present.
    pub fn remove_subscriber(&mut self, id: SubscriptionId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    pub fn has_subscriber(&self, id: SubscriptionId) -> bool {
        self.subscribers.contains_key(&id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Copy of the current callbacks, in subscription order.
    pub fn snapshot(&self) -> Vec<Callback> {
        self.subscribers.values().cloned().collect()
    }

    /// Work out what the direct watch should point at right now.
    ///
    /// With `follow_symlinks`, a symbolic link is followed one level; the
    /// target is reported even when it dangles. Returns `None` when nothing
    /// exists under the path at all.
    pub fn resolve(&self, follow_symlinks: bool) -> Option<Resolution> {
        let metadata = self.path.symlink_metadata().ok()?;

        if !follow_symlinks || !metadata.file_type().is_symlink() {
            return Some(Resolution {
                target: self.path.clone(),
                exists: true,
            });
        }

        let link = std::fs::read_link(&self.path).ok()?;
        let target = normalize(&self.directory.join(link));
        let exists = target.metadata().is_ok();
        Some(Resolution { target, exists })
    }
}

/// Canonicalize the directory part of `path`, keeping the final component.
///
/// Falls back to the path as given when its directory cannot be resolved,
/// which happens for dangling links into missing directories.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => dunce::canonicalize(parent)
            .map(|dir| dir.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => dunce::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()),
    }
}
