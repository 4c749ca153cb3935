//! Async adapter over registration callbacks.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::Notify;

use crate::registration::Registration;

/// A watched path whose changes can be awaited.
///
/// Notifications that arrive while nobody is waiting collapse into one, so
/// `changed` never queues up a backlog.
#[derive(Debug)]
pub struct ChangeStream {
    registration: Registration,
    notify: Arc<Notify>,
}

impl ChangeStream {
    pub(crate) fn new(registration: Registration, notify: Arc<Notify>) -> Self {
        Self {
            registration,
            notify,
        }
    }

    /// Wait until the path changes. Returns immediately if it changed since
    /// the last call.
    pub async fn changed(&self) {
        self.notify.notified().await;
    }

    /// Canonical path being watched.
    pub fn path(&self) -> &Path {
        self.registration.path()
    }

    /// The underlying registration.
    pub fn registration(&self) -> &Registration {
        &self.registration
    }
}
