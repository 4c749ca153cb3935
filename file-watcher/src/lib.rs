//! # File Watcher
//!
//! This crate tells Codex when individual files change on disk, so open
//! buffers and cached context can be reloaded.
//!
//! ## Features
//!
//! - **Missing Paths**: Watch files that do not exist yet
//! - **Re-arming**: Keep watching across delete/recreate and rename cycles
//! - **Symbolic Links**: Changes to a link and to its target both signal
//! - **Safe Teardown**: Registrations may outlive the service
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Watch Service                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  add_file ──► Registry ──► PathEntry ──► Registration           │
//! │                  ▲                                              │
//! │  EventSource ──► Dispatcher ──► DescriptorTable ──► callbacks   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use codex_file_watcher::WatchService;
//!
//! let service = WatchService::new()?;
//! let registration = service.add_file("Cargo.toml", || println!("changed"))?;
//! // ...
//! drop(registration);
//! # Ok::<(), codex_file_watcher::WatchError>(())
//! ```

pub mod config;
mod descriptor;
mod dispatcher;
mod entry;
pub mod error;
pub mod event;
pub mod registration;
mod registry;
pub mod service;
pub mod source;
pub mod stream;

pub use config::{Backend, WatchConfig};
pub use entry::{Callback, SubscriptionId};
pub use error::{Result, WatchError};
pub use event::{EventCategory, RawEvent};
pub use registration::Registration;
pub use service::{WatchHealth, WatchService, WatcherStats};
pub use source::{
    EventSource, KernelSource, NextBatch, ScriptedSource, SourceMessage, WatchHandle, WatchKind,
};
pub use stream::ChangeStream;
