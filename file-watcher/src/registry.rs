//! Path entry registry: subscriptions, event resolution and re-arming.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::descriptor::{DescriptorTable, WatchTarget};
use crate::entry::{Callback, PathEntry, SubscriptionId};
use crate::error::{Result, WatchError};
use crate::event::{EventCategory, RawEvent};
use crate::source::EventSource;

/// Every watched path, keyed by canonical path.
pub(crate) struct Registry {
    source: Arc<dyn EventSource>,
    follow_symlinks: bool,
    entries: HashMap<PathBuf, PathEntry>,
    descriptors: DescriptorTable,
    next_subscription: u64,
}

impl Registry {
    pub fn new(source: Arc<dyn EventSource>, follow_symlinks: bool) -> Self {
        Self {
            source,
            follow_symlinks,
            entries: HashMap::new(),
            descriptors: DescriptorTable::new(),
            next_subscription: 0,
        }
    }

    /// Add a subscriber for `path`, creating its entry and watches if needed.
    pub fn subscribe(
        &mut self,
        path: &Path,
        callback: Callback,
    ) -> Result<(PathBuf, SubscriptionId)> {
        let (directory, name) = canonical_location(path)?;
        let key = directory.join(&name);

        if !self.entries.contains_key(&key) {
            let entry = self.create_entry(directory, name)?;
            self.entries.insert(key.clone(), entry);
        }

        self.next_subscription += 1;
        let id = SubscriptionId::new(self.next_subscription);
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.add_subscriber(id, callback);
        }
        debug!("Subscribed {id} to {}", key.display());
        Ok((key, id))
    }

    /// Remove one subscriber. The last one takes the entry and its watches
    /// with it. Returns whether the subscriber existed.
    pub fn unsubscribe(&mut self, key: &Path, id: SubscriptionId) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        if !entry.remove_subscriber(id) {
            return false;
        }
        debug!("Unsubscribed {id} from {}", key.display());

        if entry.is_unsubscribed() {
            if let Some(mut entry) = self.entries.remove(key) {
                self.teardown(&mut entry);
                debug!("Stopped watching {}", key.display());
            }
        }
        true
    }

    pub fn is_subscribed(&self, key: &Path, id: SubscriptionId) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.has_subscriber(id))
    }

    /// Entries interested in `event`.
    ///
    /// Directory events match entries by final component; content changes
    /// reported by a directory watch are left to the direct watch. A
    /// directory event on the resolved target of a symbolic link also
    /// matches the link's entry.
    pub fn resolve(&self, event: &RawEvent) -> Vec<PathBuf> {
        match self.descriptors.get(event.handle) {
            None => {
                trace!("Dropping event for stale watch {}", event.handle);
                Vec::new()
            }
            Some(WatchTarget::Direct(key)) => vec![key.clone()],
            Some(WatchTarget::Directory(dir)) => {
                let Some(name) = event.name.as_deref() else {
                    return Vec::new();
                };
                if event.category == EventCategory::Modified {
                    return Vec::new();
                }

                let real_path = dir.join(name);
                let mut keys: Vec<PathBuf> = self
                    .entries
                    .values()
                    .filter(|entry| entry.directory() == dir && entry.name() == name)
                    .map(|entry| entry.path().to_path_buf())
                    .collect();
                for entry in self.entries.values() {
                    if entry.target() == Some(real_path.as_path())
                        && !keys.iter().any(|key| key == entry.path())
                    {
                        keys.push(entry.path().to_path_buf());
                    }
                }
                keys.sort();
                keys
            }
        }
    }

    /// Apply `event` to the matching entries and return the callbacks to run.
    pub fn dispatch(&mut self, event: &RawEvent) -> Vec<Callback> {
        let keys = self.resolve(event);
        let mut callbacks = Vec::new();

        for key in keys {
            let Some(entry) = self.entries.get_mut(&key) else {
                continue;
            };
            if event.category.is_arrival() || event.category.is_departure() {
                sync_with_disk(
                    self.source.as_ref(),
                    &mut self.descriptors,
                    self.follow_symlinks,
                    entry,
                );
            }
            callbacks.extend(entry.snapshot());
        }

        callbacks
    }

    /// Re-read every entry from disk after lost events and return every
    /// callback once.
    pub fn resync(&mut self) -> Vec<Callback> {
        let mut callbacks = Vec::new();
        for entry in self.entries.values_mut() {
            sync_with_disk(
                self.source.as_ref(),
                &mut self.descriptors,
                self.follow_symlinks,
                entry,
            );
            callbacks.extend(entry.snapshot());
        }
        callbacks
    }

    /// Remove every watch and entry.
    pub fn clear(&mut self) {
        for handle in self.descriptors.drain() {
            self.source.remove_watch(handle);
        }
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn present_count(&self) -> usize {
        self.entries.values().filter(|entry| entry.exists()).count()
    }

    pub fn subscription_count(&self) -> usize {
        self.entries
            .values()
            .map(PathEntry::subscriber_count)
            .sum()
    }

    pub fn directory_count(&self) -> usize {
        self.descriptors.directory_count()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.entries.keys().cloned().collect();
        paths.sort();
        paths
    }

    fn create_entry(&mut self, directory: PathBuf, name: OsString) -> Result<PathEntry> {
        if self.descriptors.retain_directory(&directory).is_none() {
            let handle = self.source.add_directory_watch(&directory)?;
            self.descriptors.insert_directory(&directory, handle);
        }

        let mut entry = PathEntry::new(directory, name);
        if let Err(e) = arm(
            self.source.as_ref(),
            &mut self.descriptors,
            self.follow_symlinks,
            &mut entry,
        ) {
            self.teardown(&mut entry);
            return Err(e);
        }

        debug!(
            "Watching {} ({})",
            entry.path().display(),
            if entry.exists() { "present" } else { "absent" }
        );
        Ok(entry)
    }

    fn teardown(&mut self, entry: &mut PathEntry) {
        if let Some(direct) = entry.mark_absent() {
            self.descriptors.remove_direct(direct);
            self.source.remove_watch(direct);
        }
        if let Some(handle) = self.descriptors.release_directory(entry.directory()) {
            self.source.remove_watch(handle);
        }
    }
}

/// Split `path` into its canonical parent directory and final component.
///
/// The final component is kept as given so a symbolic link is watched as a
/// link.
pub(crate) fn canonical_location(path: &Path) -> Result<(PathBuf, OsString)> {
    let absolute =
        std::path::absolute(path).map_err(|e| WatchError::unwatchable(path, e.to_string()))?;
    let name = absolute
        .file_name()
        .ok_or_else(|| WatchError::unwatchable(path, "path has no file name"))?
        .to_os_string();
    let parent = absolute
        .parent()
        .ok_or_else(|| WatchError::unwatchable(path, "path has no parent directory"))?;

    let directory = dunce::canonicalize(parent).map_err(|e| {
        WatchError::unwatchable(
            path,
            format!("parent directory {} is not accessible: {e}", parent.display()),
        )
    })?;
    if !directory.is_dir() {
        return Err(WatchError::unwatchable(
            path,
            format!("{} is not a directory", directory.display()),
        ));
    }

    Ok((directory, name))
}

/// Bring the direct watch in line with what is on disk now.
///
/// Any existing direct watch is replaced, since the path may now lead to a
/// different file. Failures leave the entry absent.
fn sync_with_disk(
    source: &dyn EventSource,
    descriptors: &mut DescriptorTable,
    follow_symlinks: bool,
    entry: &mut PathEntry,
) {
    let was_present = entry.exists();
    if let Err(e) = arm(source, descriptors, follow_symlinks, entry) {
        warn!("Failed to re-arm {}: {e}", entry.path().display());
    }
    match (was_present, entry.exists()) {
        (false, true) => debug!("{} appeared", entry.path().display()),
        (true, false) => debug!("{} disappeared", entry.path().display()),
        _ => {}
    }
}

fn arm(
    source: &dyn EventSource,
    descriptors: &mut DescriptorTable,
    follow_symlinks: bool,
    entry: &mut PathEntry,
) -> Result<()> {
    if let Some(old) = entry.mark_absent() {
        descriptors.remove_direct(old);
        source.remove_watch(old);
    }

    let Some(resolution) = entry.resolve(follow_symlinks) else {
        entry.set_target(None);
        return Ok(());
    };
    entry.set_target(Some(resolution.target.clone()));
    if !resolution.exists {
        return Ok(());
    }

    match source.add_file_watch(&resolution.target) {
        Ok(handle) => {
            descriptors.insert_direct(entry.path(), handle);
            entry.mark_present(handle);
            Ok(())
        }
        // Deleted between the existence check and the watch.
        Err(e) if resolution.target.metadata().is_err() => {
            debug!("{} vanished while arming: {e}", resolution.target.display());
            Ok(())
        }
        Err(e) => Err(e),
    }
}
