//! Caller-held subscription handles.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Weak;

use crate::entry::SubscriptionId;
use crate::service::Shared;

/// One subscription to a path's changes.
///
/// Dropping it stops that subscription only; other registrations on the same
/// path keep firing. A registration never keeps the service alive: if the
/// service is already gone, dropping it does nothing.
#[must_use = "dropping a Registration immediately stops its notifications"]
pub struct Registration {
    shared: Weak<Shared>,
    path: PathBuf,
    id: SubscriptionId,
}

impl Registration {
    pub(crate) fn new(shared: Weak<Shared>, path: PathBuf, id: SubscriptionId) -> Self {
        Self { shared, path, id }
    }

    /// Canonical path this registration watches.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Subscription id, unique within its service.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Whether notifications can still arrive through this registration.
    pub fn is_active(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.is_subscribed(&self.path, self.id))
    }

    /// Stop notifications. Same as dropping.
    pub fn cancel(self) {}
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.unsubscribe(&self.path, self.id);
        }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("path", &self.path)
            .field("id", &self.id)
            .finish()
    }
}
