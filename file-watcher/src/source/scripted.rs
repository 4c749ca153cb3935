//! In-memory event source driven by the caller.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

use super::{EventSource, SourceMessage, WatchHandle, WatchKind};
use crate::error::{Result, WatchError};
use crate::event::RawEvent;

/// An [`EventSource`] that never touches the kernel.
///
/// Watches are only recorded; events are whatever the caller pushes. Used to
/// drive the dispatcher deterministically and to stand in for platforms
/// without a native backend.
pub struct ScriptedSource {
    tx: Sender<SourceMessage>,
    rx: Receiver<SourceMessage>,
    state: Mutex<ScriptedState>,
}

#[derive(Default)]
struct ScriptedState {
    next_handle: u64,
    watches: BTreeMap<WatchHandle, (PathBuf, WatchKind)>,
    refused: HashSet<PathBuf>,
}

impl ScriptedSource {
    /// Create an empty source.
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            state: Mutex::new(ScriptedState {
                next_handle: 1,
                ..Default::default()
            }),
        }
    }

    /// Publish a batch of events.
    pub fn push_batch(&self, events: Vec<RawEvent>) {
        let _ = self.tx.send(SourceMessage::Batch(events));
    }

    /// Report that events were dropped.
    pub fn push_overflow(&self) {
        let _ = self.tx.send(SourceMessage::Overflow);
    }

    /// Report a read failure.
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.tx.send(SourceMessage::Failed(reason.into()));
    }

    /// Make future watch installations on `path` fail.
    pub fn refuse(&self, path: impl Into<PathBuf>) {
        self.state.lock().refused.insert(path.into());
    }

    /// Handle of the live watch of `kind` on `path`, if any.
    pub fn handle_for(&self, path: &Path, kind: WatchKind) -> Option<WatchHandle> {
        self.state
            .lock()
            .watches
            .iter()
            .find(|(_, (watched, k))| watched == path && *k == kind)
            .map(|(handle, _)| *handle)
    }

    /// Every live watch, ordered by handle.
    pub fn watches(&self) -> Vec<(WatchHandle, PathBuf, WatchKind)> {
        self.state
            .lock()
            .watches
            .iter()
            .map(|(handle, (path, kind))| (*handle, path.clone(), *kind))
            .collect()
    }

    fn install(&self, path: &Path, kind: WatchKind) -> Result<WatchHandle> {
        let mut state = self.state.lock();
        if state.refused.contains(path) {
            return Err(WatchError::installation(path, "refused by scripted source"));
        }
        let handle = WatchHandle::new(state.next_handle);
        state.next_handle += 1;
        state.watches.insert(handle, (path.to_path_buf(), kind));
        Ok(handle)
    }
}

impl Default for ScriptedSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSource for ScriptedSource {
    fn add_directory_watch(&self, path: &Path) -> Result<WatchHandle> {
        self.install(path, WatchKind::Directory)
    }

    fn add_file_watch(&self, path: &Path) -> Result<WatchHandle> {
        self.install(path, WatchKind::File)
    }

    fn remove_watch(&self, handle: WatchHandle) {
        self.state.lock().watches.remove(&handle);
    }

    fn messages(&self) -> &Receiver<SourceMessage> {
        &self.rx
    }
}
