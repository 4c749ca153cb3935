//! Kernel event sources.
//!
//! The dispatcher and registry only see the [`EventSource`] trait. Each
//! backend translates its platform's notifications into [`RawEvent`]s.

use std::fmt;
use std::path::Path;

use crossbeam_channel::{Receiver, select};

use crate::error::Result;
use crate::event::RawEvent;

mod kernel;
mod scripted;

pub use kernel::KernelSource;
pub use scripted::ScriptedSource;

/// Identifies one installed kernel watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchHandle(u64);

impl WatchHandle {
    /// Wrap a raw handle value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw handle value.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wd#{}", self.0)
    }
}

/// What a watch was installed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    /// Directory watch, reporting changes to its children.
    Directory,

    /// Direct watch on a file.
    File,
}

/// Message delivered by a source to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceMessage {
    /// Events read from the kernel in one go.
    Batch(Vec<RawEvent>),

    /// The kernel dropped events; watch state must be re-read from disk.
    Overflow,

    /// Reading from the kernel failed. No further events will arrive.
    Failed(String),
}

/// Outcome of [`EventSource::next_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextBatch {
    /// Events to dispatch.
    Events(Vec<RawEvent>),

    /// Events were lost.
    Overflow,

    /// The stop signal fired.
    Stopped,

    /// The source is broken.
    Failed(String),
}

/// A platform file notification primitive.
pub trait EventSource: Send + Sync {
    /// Watch a directory for creation, deletion and renames of its children.
    fn add_directory_watch(&self, path: &Path) -> Result<WatchHandle>;

    /// Watch a file for content changes and its own deletion.
    fn add_file_watch(&self, path: &Path) -> Result<WatchHandle>;

    /// Remove a watch. Unknown or already invalidated handles are ignored.
    fn remove_watch(&self, handle: WatchHandle);

    /// Channel on which the source publishes what it reads from the kernel.
    fn messages(&self) -> &Receiver<SourceMessage>;

    /// Block until the next batch arrives or `stop` fires.
    fn next_batch(&self, stop: &Receiver<()>) -> NextBatch {
        if stop.try_recv().is_ok() {
            return NextBatch::Stopped;
        }
        select! {
            recv(stop) -> _ => NextBatch::Stopped,
            recv(self.messages()) -> msg => match msg {
                Ok(SourceMessage::Batch(events)) => NextBatch::Events(events),
                Ok(SourceMessage::Overflow) => NextBatch::Overflow,
                Ok(SourceMessage::Failed(reason)) => NextBatch::Failed(reason),
                Err(_) => NextBatch::Failed("event source disconnected".to_string()),
            },
        }
    }
}
