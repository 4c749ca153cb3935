//! Event source backed by the `notify` crate.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, unbounded};
use notify::{ErrorKind, PollWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use super::{EventSource, SourceMessage, WatchHandle, WatchKind};
use crate::config::WatchConfig;
use crate::error::{Result, WatchError};
use crate::event::{EventCategory, RawEvent, classify};

/// Event source using the platform's native notifications, or polling.
///
/// `notify` identifies watches by path, so handles are allocated here and
/// several handles may share one underlying watch. The kernel watch is
/// installed with the first handle on a path and removed with the last.
pub struct KernelSource {
    watcher: Mutex<Box<dyn Watcher + Send>>,
    table: Arc<Mutex<HandleTable>>,
    rx: Receiver<SourceMessage>,
}

#[derive(Default)]
struct HandleTable {
    next_handle: u64,
    by_handle: HashMap<WatchHandle, (PathBuf, WatchKind)>,
    by_path: HashMap<PathBuf, Vec<WatchHandle>>,
    /// Files whose last content change has been forwarded but not yet seen
    /// a second time through their parent's watch.
    awaiting_echo: HashSet<PathBuf>,
}

impl HandleTable {
    fn allocate(&mut self, path: &Path, kind: WatchKind) -> WatchHandle {
        self.next_handle += 1;
        let handle = WatchHandle::new(self.next_handle);
        self.by_handle.insert(handle, (path.to_path_buf(), kind));
        self.by_path.entry(path.to_path_buf()).or_default().push(handle);
        handle
    }

    /// Drop a handle. Returns the path if no handle is left on it.
    fn release(&mut self, handle: WatchHandle) -> Option<PathBuf> {
        let (path, _) = self.by_handle.remove(&handle)?;
        let handles = self.by_path.get_mut(&path)?;
        handles.retain(|h| *h != handle);
        if handles.is_empty() {
            self.by_path.remove(&path);
            self.awaiting_echo.remove(&path);
            Some(path)
        } else {
            None
        }
    }

    fn is_watched(&self, path: &Path) -> bool {
        self.by_path.contains_key(path)
    }

    fn handles_on(&self, path: &Path, kind: WatchKind) -> impl Iterator<Item = WatchHandle> + '_ {
        self.by_path
            .get(path)
            .into_iter()
            .flatten()
            .copied()
            .filter(move |handle| {
                self.by_handle
                    .get(handle)
                    .is_some_and(|(_, k)| *k == kind)
            })
    }

    /// Whether a content change on `path` is reported twice: once by its
    /// own watch and once by its parent directory's.
    fn is_doubly_watched(&self, path: &Path) -> bool {
        let has_directory_watch = |parent: &Path| {
            self.handles_on(parent, WatchKind::Directory)
                .next()
                .is_some()
        };
        self.handles_on(path, WatchKind::File).next().is_some()
            && path.parent().is_some_and(has_directory_watch)
    }

    /// Turn one notify event into raw events for every handle it concerns.
    ///
    /// notify does not say which watch produced an event, so a write to a
    /// file watched directly inside a watched directory arrives as two
    /// identical events. The second of each such pair is dropped.
    fn translate(&mut self, event: &notify::Event) -> Vec<RawEvent> {
        let mut out = Vec::new();
        for (path, category) in classify(&event.kind, &event.paths) {
            if category == EventCategory::Modified && self.is_doubly_watched(&path) {
                if self.awaiting_echo.remove(&path) {
                    trace!("Dropping echoed change on {}", path.display());
                    continue;
                }
                self.awaiting_echo.insert(path.clone());
            } else {
                self.awaiting_echo.remove(&path);
            }

            for handle in self.handles_on(&path, WatchKind::File) {
                out.push(RawEvent::direct(handle, category));
            }
            if let (Some(parent), Some(name)) = (path.parent(), path.file_name()) {
                for handle in self.handles_on(parent, WatchKind::Directory) {
                    out.push(RawEvent::child(handle, name, category));
                }
            }
        }
        out
    }
}

/// Forwards notify callbacks onto the source's channel.
struct Translator {
    table: Arc<Mutex<HandleTable>>,
    tx: Sender<SourceMessage>,
}

impl notify::EventHandler for Translator {
    fn handle_event(&mut self, event: notify::Result<notify::Event>) {
        let message = match event {
            Ok(event) if event.need_rescan() => {
                warn!("Kernel event queue overflowed, rescanning watched paths");
                SourceMessage::Overflow
            }
            Ok(event) => {
                let events = self.table.lock().translate(&event);
                if events.is_empty() {
                    trace!("Ignoring event {:?} on {:?}", event.kind, event.paths);
                    return;
                }
                SourceMessage::Batch(events)
            }
            Err(e) if is_transient(&e) => {
                debug!("Ignoring transient watch error: {e}");
                return;
            }
            Err(e) => {
                error!("Watch error: {e}");
                SourceMessage::Failed(e.to_string())
            }
        };

        // The receiver only goes away with the source itself.
        let _ = self.tx.send(message);
    }
}

/// Errors caused by a watched path disappearing under us.
fn is_transient(error: &notify::Error) -> bool {
    match &error.kind {
        ErrorKind::PathNotFound | ErrorKind::WatchNotFound => true,
        ErrorKind::Io(io) => io.kind() == std::io::ErrorKind::NotFound,
        _ => false,
    }
}

impl KernelSource {
    /// Create a source with the backend selected by `config`.
    pub fn new(config: &WatchConfig) -> Result<Self> {
        config.validate()?;

        let (tx, rx) = unbounded();
        let table = Arc::new(Mutex::new(HandleTable::default()));
        let translator = Translator {
            table: table.clone(),
            tx,
        };

        let watcher: Box<dyn Watcher + Send> = match config.backend.poll_interval() {
            None => Box::new(notify::recommended_watcher(translator)?),
            Some(interval) => Box::new(PollWatcher::new(
                translator,
                // Modification times are compared at whole-second
                // resolution, so writes within one scan interval need the
                // content hash to be noticed.
                notify::Config::default()
                    .with_poll_interval(interval)
                    .with_compare_contents(true),
            )?),
        };

        debug!("Created kernel event source ({:?})", config.backend);
        Ok(Self {
            watcher: Mutex::new(watcher),
            table,
            rx,
        })
    }

    fn install(&self, path: &Path, kind: WatchKind) -> Result<WatchHandle> {
        // The watcher lock is taken first and the table lock only briefly:
        // notify may call the translator, which locks the table, while
        // `watch` is waiting on its event thread.
        let mut watcher = self.watcher.lock();
        let already_watched = self.table.lock().is_watched(path);
        if !already_watched {
            watcher
                .watch(path, RecursiveMode::NonRecursive)
                .map_err(|e| WatchError::installation(path, e))?;
        }
        let handle = self.table.lock().allocate(path, kind);
        debug!("Installed {kind:?} watch {handle} on {}", path.display());
        Ok(handle)
    }
}

impl EventSource for KernelSource {
    fn add_directory_watch(&self, path: &Path) -> Result<WatchHandle> {
        self.install(path, WatchKind::Directory)
    }

    fn add_file_watch(&self, path: &Path) -> Result<WatchHandle> {
        self.install(path, WatchKind::File)
    }

    fn remove_watch(&self, handle: WatchHandle) {
        let mut watcher = self.watcher.lock();
        let released = self.table.lock().release(handle);
        if let Some(path) = released {
            // A deleted file's watch is already gone from the kernel.
            match watcher.unwatch(&path) {
                Ok(()) => debug!("Removed watch {handle} on {}", path.display()),
                Err(e) => debug!("Watch {handle} on {} already gone: {e}", path.display()),
            }
        }
    }

    fn messages(&self) -> &Receiver<SourceMessage> {
        &self.rx
    }
}
