//! Raw events produced by an event source.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use notify::event::{MetadataKind, ModifyKind, RenameMode};
use notify::EventKind;
use serde::{Deserialize, Serialize};

use crate::source::WatchHandle;

/// A change reported by the kernel for one watch.
///
/// Directory watches carry the name of the changed child; direct watches
/// carry no name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// The watch that reported the change.
    pub handle: WatchHandle,

    /// Changed child, for directory watches.
    pub name: Option<OsString>,

    /// What happened.
    pub category: EventCategory,
}

impl RawEvent {
    /// Event reported by a direct watch on a file.
    pub fn direct(handle: WatchHandle, category: EventCategory) -> Self {
        Self {
            handle,
            name: None,
            category,
        }
    }

    /// Event reported by a directory watch about one of its children.
    pub fn child(handle: WatchHandle, name: impl Into<OsString>, category: EventCategory) -> Self {
        Self {
            handle,
            name: Some(name.into()),
            category,
        }
    }
}

/// Kind of change carried by a [`RawEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Content was written.
    Modified,

    /// The file was deleted.
    Removed,

    /// The file was created.
    Created,

    /// The file was moved away from this name.
    RenamedFrom,

    /// A file was moved onto this name.
    RenamedTo,
}

impl EventCategory {
    /// Whether a file now exists under the event's name.
    pub fn is_arrival(self) -> bool {
        matches!(self, Self::Created | Self::RenamedTo)
    }

    /// Whether the file under the event's name went away.
    pub fn is_departure(self) -> bool {
        matches!(self, Self::Removed | Self::RenamedFrom)
    }
}

/// Split a notify event into per-path categories.
///
/// Renames reported with both ends yield a `RenamedFrom` for the first path
/// and a `RenamedTo` for the second. Renames of unknown direction are
/// classified by whether the path exists now.
pub(crate) fn classify(kind: &EventKind, paths: &[PathBuf]) -> Vec<(PathBuf, EventCategory)> {
    let single = |category: EventCategory| {
        paths
            .iter()
            .map(|path| (path.clone(), category))
            .collect::<Vec<_>>()
    };

    match kind {
        EventKind::Create(_) => single(EventCategory::Created),
        EventKind::Remove(_) => single(EventCategory::Removed),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => single(EventCategory::RenamedFrom),
            RenameMode::To => single(EventCategory::RenamedTo),
            RenameMode::Both => {
                let mut out = Vec::with_capacity(2);
                if let Some(from) = paths.first() {
                    out.push((from.clone(), EventCategory::RenamedFrom));
                }
                if let Some(to) = paths.get(1) {
                    out.push((to.clone(), EventCategory::RenamedTo));
                }
                out
            }
            RenameMode::Any | RenameMode::Other => paths
                .iter()
                .map(|path| (path.clone(), rename_direction(path)))
                .collect(),
        },
        EventKind::Modify(ModifyKind::Metadata(MetadataKind::AccessTime)) => Vec::new(),
        EventKind::Modify(_) | EventKind::Any => single(EventCategory::Modified),
        EventKind::Access(_) | EventKind::Other => Vec::new(),
    }
}

fn rename_direction(path: &Path) -> EventCategory {
    if path.symlink_metadata().is_ok() {
        EventCategory::RenamedTo
    } else {
        EventCategory::RenamedFrom
    }
}
