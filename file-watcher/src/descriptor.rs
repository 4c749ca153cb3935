//! Watch descriptor table: which kernel watch serves which path entry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::source::WatchHandle;

/// What a kernel watch was installed for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WatchTarget {
    /// Directory watch shared by every entry in this directory.
    Directory(PathBuf),

    /// Direct watch owned by the entry with this key.
    Direct(PathBuf),
}

/// A directory watch and the number of entries relying on it.
#[derive(Debug, Clone, Copy)]
struct DirectoryWatch {
    handle: WatchHandle,
    users: usize,
}

/// Maps kernel watch handles to their targets and shares directory watches.
#[derive(Debug, Default)]
pub(crate) struct DescriptorTable {
    targets: HashMap<WatchHandle, WatchTarget>,
    directories: HashMap<PathBuf, DirectoryWatch>,
}

impl DescriptorTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, handle: WatchHandle) -> Option<&WatchTarget> {
        self.targets.get(&handle)
    }

    /// Take another reference on the directory watch for `dir`, if one exists.
    pub fn retain_directory(&mut self, dir: &Path) -> Option<WatchHandle> {
        let watch = self.directories.get_mut(dir)?;
        watch.users += 1;
        Some(watch.handle)
    }

    /// Record a freshly installed directory watch with one user.
    pub fn insert_directory(&mut self, dir: &Path, handle: WatchHandle) {
        self.targets
            .insert(handle, WatchTarget::Directory(dir.to_path_buf()));
        self.directories
            .insert(dir.to_path_buf(), DirectoryWatch { handle, users: 1 });
    }

    /// Drop one reference on the directory watch for `dir`.
    ///
    /// Returns the handle once nobody uses it anymore; the caller removes the
    /// kernel watch.
    pub fn release_directory(&mut self, dir: &Path) -> Option<WatchHandle> {
        let watch = self.directories.get_mut(dir)?;
        watch.users = watch.users.saturating_sub(1);
        if watch.users > 0 {
            return None;
        }
        let handle = watch.handle;
        self.directories.remove(dir);
        self.targets.remove(&handle);
        Some(handle)
    }

    pub fn insert_direct(&mut self, key: &Path, handle: WatchHandle) {
        self.targets
            .insert(handle, WatchTarget::Direct(key.to_path_buf()));
    }

    pub fn remove_direct(&mut self, handle: WatchHandle) {
        self.targets.remove(&handle);
    }

    pub fn directory_count(&self) -> usize {
        self.directories.len()
    }

    /// Forget everything, returning every handle still installed.
    pub fn drain(&mut self) -> Vec<WatchHandle> {
        self.directories.clear();
        self.targets.drain().map(|(handle, _)| handle).collect()
    }
}
