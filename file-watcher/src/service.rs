//! The watch service: public entry point owning the registry and dispatcher.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::config::WatchConfig;
use crate::dispatcher::{self, DispatcherHandle};
use crate::entry::{Callback, SubscriptionId};
use crate::error::{Result, WatchError};
use crate::event::RawEvent;
use crate::registration::Registration;
use crate::registry::Registry;
use crate::source::{EventSource, KernelSource};
use crate::stream::ChangeStream;

/// Signals changes to individual files, existing or not.
///
/// Each watched path gets a watch on its parent directory, to see it appear
/// and disappear, and while it exists a direct watch, to see its content
/// change. Callbacks run on a background dispatcher thread that is started
/// with the first registration.
///
/// Dropping the service stops the dispatcher and waits for it, so no
/// callback runs once `drop` returns. Registrations may outlive the service;
/// they become inert.
pub struct WatchService {
    shared: Arc<Shared>,
}

impl WatchService {
    /// Create a service using the native kernel backend.
    pub fn new() -> Result<Self> {
        Self::with_config(WatchConfig::default())
    }

    /// Create a service with the backend selected by `config`.
    pub fn with_config(config: WatchConfig) -> Result<Self> {
        let source = KernelSource::new(&config)?;
        Self::with_source(Arc::new(source), config)
    }

    /// Create a service reading from a custom event source.
    pub fn with_source(source: Arc<dyn EventSource>, config: WatchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared::new(source, config)),
        })
    }

    /// Call `on_change` whenever `path` changes.
    ///
    /// The path does not need to exist; its parent directory does. The
    /// callback runs on the dispatcher thread, possibly several times per
    /// change, and should return quickly: a blocked callback holds up every
    /// other notification. Dropping the returned [`Registration`] stops the
    /// notifications.
    pub fn add_file<F>(&self, path: impl AsRef<Path>, on_change: F) -> Result<Registration>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (key, id) = self.shared.subscribe(path.as_ref(), Arc::new(on_change))?;
        Ok(Registration::new(Arc::downgrade(&self.shared), key, id))
    }

    /// Watch `path` and await its changes instead of receiving callbacks.
    pub fn watch_async(&self, path: impl AsRef<Path>) -> Result<ChangeStream> {
        let notify = Arc::new(tokio::sync::Notify::new());
        let signal = notify.clone();
        let registration = self.add_file(path, move || signal.notify_one())?;
        Ok(ChangeStream::new(registration, notify))
    }

    /// Whether the dispatcher is still able to deliver notifications.
    pub fn health(&self) -> WatchHealth {
        self.shared.state.lock().health.clone()
    }

    /// Counters describing the current watch state.
    pub fn stats(&self) -> WatcherStats {
        let state = self.shared.state.lock();
        WatcherStats {
            watched_paths: state.registry.len(),
            present_paths: state.registry.present_count(),
            subscriptions: state.registry.subscription_count(),
            directory_watches: state.registry.directory_count(),
            events_dispatched: state.events_dispatched,
            last_event_at: state.last_event_at,
            dispatcher_running: state
                .dispatcher
                .as_ref()
                .is_some_and(DispatcherHandle::is_running),
        }
    }

    /// Canonical paths currently watched.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.shared.state.lock().registry.paths()
    }

    /// The configuration in use.
    pub fn config(&self) -> &WatchConfig {
        self.shared.config()
    }
}

impl Drop for WatchService {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

/// Dispatcher health. Degradation is permanent for a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum WatchHealth {
    /// Events are being delivered.
    Healthy,

    /// The event source failed; nothing will be delivered anymore.
    Degraded {
        /// What went wrong.
        reason: String,

        /// When the dispatcher stopped.
        since: DateTime<Utc>,
    },
}

impl WatchHealth {
    /// Whether notifications are still being delivered.
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Statistics about the watch service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherStats {
    /// Distinct paths watched.
    pub watched_paths: usize,

    /// Watched paths that currently exist.
    pub present_paths: usize,

    /// Live registrations.
    pub subscriptions: usize,

    /// Directory watches installed.
    pub directory_watches: usize,

    /// Raw events that reached at least one subscriber.
    pub events_dispatched: u64,

    /// When the last such event was dispatched.
    pub last_event_at: Option<DateTime<Utc>>,

    /// Whether a dispatcher thread is running.
    pub dispatcher_running: bool,
}

/// State shared by the service, its dispatcher and its registrations.
///
/// Registrations hold it weakly; the dispatcher holds it strongly only while
/// it runs, and the service joins the dispatcher before letting go.
pub(crate) struct Shared {
    source: Arc<dyn EventSource>,
    config: WatchConfig,
    state: Mutex<State>,
}

struct State {
    registry: Registry,
    dispatcher: Option<DispatcherHandle>,
    /// Stopped dispatchers not joined yet.
    retiring: Vec<JoinHandle<()>>,
    health: WatchHealth,
    events_dispatched: u64,
    last_event_at: Option<DateTime<Utc>>,
    torn_down: bool,
}

impl Shared {
    fn new(source: Arc<dyn EventSource>, config: WatchConfig) -> Self {
        let registry = Registry::new(source.clone(), config.follow_symlinks);
        Self {
            source,
            config,
            state: Mutex::new(State {
                registry,
                dispatcher: None,
                retiring: Vec::new(),
                health: WatchHealth::Healthy,
                events_dispatched: 0,
                last_event_at: None,
                torn_down: false,
            }),
        }
    }

    pub fn source(&self) -> &dyn EventSource {
        self.source.as_ref()
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    fn subscribe(
        self: &Arc<Self>,
        path: &Path,
        callback: Callback,
    ) -> Result<(PathBuf, SubscriptionId)> {
        let mut state = self.state.lock();
        if let WatchHealth::Degraded { reason, .. } = &state.health {
            return Err(WatchError::Degraded(reason.clone()));
        }

        let (key, id) = state.registry.subscribe(path, callback)?;

        if state.dispatcher.is_none() {
            let predecessors = std::mem::take(&mut state.retiring);
            match dispatcher::spawn(self.clone(), predecessors) {
                Ok(handle) => state.dispatcher = Some(handle),
                Err(e) => {
                    state.registry.unsubscribe(&key, id);
                    return Err(e);
                }
            }
        }

        Ok((key, id))
    }

    /// Remove a subscription. No-op once the service has been torn down.
    ///
    /// Removing the last path stops the dispatcher and, unless called from
    /// a callback, waits for it to exit.
    pub fn unsubscribe(&self, key: &Path, id: SubscriptionId) {
        let exited = {
            let mut state = self.state.lock();
            if state.torn_down {
                return;
            }
            if !state.registry.unsubscribe(key, id) || !state.registry.is_empty() {
                return;
            }
            let Some(handle) = state.dispatcher.take() else {
                return;
            };

            debug!("No paths left to watch, stopping dispatcher");
            handle.signal_stop();
            let on_dispatcher = handle.is_current();
            // The thread itself is joined by its successor or by shutdown,
            // so a restart never overlaps with it.
            let (thread, exited) = handle.retire();
            state.retiring.push(thread);
            if on_dispatcher {
                return;
            }
            exited
        };

        // Outside the lock: the dispatcher may need it to finish its batch.
        let _ = exited.recv();
        debug!("Dispatcher exited");
    }

    pub fn is_subscribed(&self, key: &Path, id: SubscriptionId) -> bool {
        let state = self.state.lock();
        !state.torn_down && state.registry.is_subscribed(key, id)
    }

    /// Apply one raw event and snapshot the callbacks to run.
    pub fn dispatch(&self, event: &RawEvent) -> Vec<Callback> {
        let mut state = self.state.lock();
        if state.torn_down {
            return Vec::new();
        }
        let callbacks = state.registry.dispatch(event);
        if !callbacks.is_empty() {
            state.events_dispatched += 1;
            state.last_event_at = Some(Utc::now());
        }
        callbacks
    }

    /// Re-read every entry after lost events.
    pub fn resync(&self) -> Vec<Callback> {
        let mut state = self.state.lock();
        if state.torn_down {
            return Vec::new();
        }
        let callbacks = state.registry.resync();
        if !callbacks.is_empty() {
            state.events_dispatched += 1;
            state.last_event_at = Some(Utc::now());
        }
        callbacks
    }

    /// Record a fatal source failure.
    pub fn degrade(&self, reason: &str) {
        let mut state = self.state.lock();
        if state.health.is_healthy() {
            error!("File watcher degraded, notifications stopped: {reason}");
            state.health = WatchHealth::Degraded {
                reason: reason.to_string(),
                since: Utc::now(),
            };
        }
    }

    fn shutdown(&self) {
        let (dispatcher, retiring) = {
            let mut state = self.state.lock();
            state.torn_down = true;
            (state.dispatcher.take(), std::mem::take(&mut state.retiring))
        };

        if let Some(handle) = dispatcher {
            handle.stop_and_join();
        }
        for thread in retiring {
            dispatcher::join(thread);
        }

        self.state.lock().registry.clear();
        info!("File watcher shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventCategory;
    use crate::source::{ScriptedSource, WatchKind};
    use crossbeam_channel::{Receiver, unbounded};
    use pretty_assertions::assert_eq;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(2);
    const QUIET: Duration = Duration::from_millis(200);

    struct Fixture {
        _temp_dir: TempDir,
        dir: PathBuf,
        source: Arc<ScriptedSource>,
        service: WatchService,
    }

    fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let dir = dunce::canonicalize(temp_dir.path()).unwrap();
        let source = Arc::new(ScriptedSource::new());
        let service = WatchService::with_source(source.clone(), WatchConfig::default()).unwrap();
        Fixture {
            _temp_dir: temp_dir,
            dir,
            source,
            service,
        }
    }

    impl Fixture {
        fn existing_file(&self, name: &str) -> PathBuf {
            let path = self.dir.join(name);
            std::fs::write(&path, b"").unwrap();
            path
        }

        fn modify(&self, path: &Path) {
            let handle = self.source.handle_for(path, WatchKind::File).unwrap();
            self.source
                .push_batch(vec![RawEvent::direct(handle, EventCategory::Modified)]);
        }
    }

    fn signal() -> (Receiver<()>, impl Fn() + Send + Sync + 'static) {
        let (tx, rx) = unbounded();
        (rx, move || {
            let _ = tx.send(());
        })
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    #[test]
    fn test_add_file_starts_dispatcher_and_delivers() {
        let f = fixture();
        let file = f.existing_file("app.log");
        assert!(!f.service.stats().dispatcher_running);

        let (rx, callback) = signal();
        let registration = f.service.add_file(&file, callback).unwrap();
        assert_eq!(registration.path(), file.as_path());
        assert!(registration.is_active());

        f.modify(&file);
        rx.recv_timeout(WAIT).unwrap();

        let stats = f.service.stats();
        assert!(stats.dispatcher_running);
        assert_eq!(stats.watched_paths, 1);
        assert_eq!(stats.present_paths, 1);
        assert_eq!(stats.events_dispatched, 1);
        assert!(stats.last_event_at.is_some());
    }

    #[test]
    fn test_each_registration_on_a_path_is_notified() {
        let f = fixture();
        let file = f.existing_file("app.log");
        let (rx, callback) = signal();
        let _first = f.service.add_file(&file, callback).unwrap();
        let (rx2, callback2) = signal();
        let _second = f.service.add_file(&file, callback2).unwrap();

        f.modify(&file);

        rx.recv_timeout(WAIT).unwrap();
        rx2.recv_timeout(WAIT).unwrap();
        assert_eq!(f.service.stats().subscriptions, 2);
    }

    #[test]
    fn test_dropped_registration_is_not_notified() {
        let f = fixture();
        let file = f.existing_file("app.log");
        let (dropped_rx, dropped_callback) = signal();
        let dropped = f.service.add_file(&file, dropped_callback).unwrap();
        let (kept_rx, kept_callback) = signal();
        let _kept = f.service.add_file(&file, kept_callback).unwrap();

        dropped.cancel();
        f.modify(&file);

        kept_rx.recv_timeout(WAIT).unwrap();
        assert!(dropped_rx.recv_timeout(QUIET).is_err());
    }

    #[test]
    fn test_events_are_delivered_in_order() {
        let f = fixture();
        let a = f.existing_file("a.log");
        let b = f.existing_file("b.log");
        let (tx, rx) = unbounded();
        let tx_b = tx.clone();
        let _a = f.service.add_file(&a, move || tx.send("a").unwrap()).unwrap();
        let _b = f
            .service
            .add_file(&b, move || tx_b.send("b").unwrap())
            .unwrap();

        let handle_a = f.source.handle_for(&a, WatchKind::File).unwrap();
        let handle_b = f.source.handle_for(&b, WatchKind::File).unwrap();
        f.source.push_batch(vec![
            RawEvent::direct(handle_a, EventCategory::Modified),
            RawEvent::direct(handle_b, EventCategory::Modified),
            RawEvent::direct(handle_a, EventCategory::Modified),
        ]);

        let received: Vec<_> = (0..3).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        assert_eq!(received, vec!["a", "b", "a"]);
    }

    #[test]
    fn test_identical_consecutive_events_are_coalesced() {
        let f = fixture();
        let file = f.existing_file("app.log");
        let (rx, callback) = signal();
        let _registration = f.service.add_file(&file, callback).unwrap();

        let handle = f.source.handle_for(&file, WatchKind::File).unwrap();
        let event = RawEvent::direct(handle, EventCategory::Modified);
        f.source.push_batch(vec![event.clone(), event]);

        rx.recv_timeout(WAIT).unwrap();
        assert!(rx.recv_timeout(QUIET).is_err());
    }

    #[test]
    fn test_creation_then_modification_of_missing_file() {
        let f = fixture();
        let file = f.dir.join("later.log");
        let (rx, callback) = signal();
        let _registration = f.service.add_file(&file, callback).unwrap();
        assert_eq!(f.service.stats().present_paths, 0);

        std::fs::write(&file, b"hello").unwrap();
        let dir_handle = f.source.handle_for(&f.dir, WatchKind::Directory).unwrap();
        f.source.push_batch(vec![RawEvent::child(
            dir_handle,
            "later.log",
            EventCategory::Created,
        )]);
        rx.recv_timeout(WAIT).unwrap();
        assert!(wait_until(|| f.service.stats().present_paths == 1));

        f.modify(&file);
        rx.recv_timeout(WAIT).unwrap();
    }

    #[test]
    fn test_callback_can_drop_its_own_registration() {
        let f = fixture();
        let file = f.existing_file("app.log");
        let slot: Arc<Mutex<Option<Registration>>> = Arc::new(Mutex::new(None));
        let (tx, rx) = unbounded();

        let own = slot.clone();
        let registration = f
            .service
            .add_file(&file, move || {
                drop(own.lock().take());
                let _ = tx.send(());
            })
            .unwrap();
        *slot.lock() = Some(registration);

        f.modify(&file);
        rx.recv_timeout(WAIT).unwrap();
        assert!(wait_until(|| f.service.stats().watched_paths == 0));

        // The dispatcher stopped itself; a new registration restarts it.
        let (rx2, callback) = signal();
        let _again = f.service.add_file(&file, callback).unwrap();
        f.modify(&file);
        rx2.recv_timeout(WAIT).unwrap();
    }

    #[test]
    fn test_dispatcher_stops_with_last_path_and_restarts() {
        let f = fixture();
        let file = f.existing_file("app.log");
        let (_rx, callback) = signal();
        let registration = f.service.add_file(&file, callback).unwrap();
        assert!(f.service.stats().dispatcher_running);

        drop(registration);
        assert!(!f.service.stats().dispatcher_running);
        assert!(f.source.watches().is_empty());

        let (rx, callback) = signal();
        let _registration = f.service.add_file(&file, callback).unwrap();
        assert!(f.service.stats().dispatcher_running);
        f.modify(&file);
        rx.recv_timeout(WAIT).unwrap();
    }

    #[test]
    fn test_dropping_last_registration_waits_for_dispatcher() {
        let f = fixture();
        let file = f.existing_file("app.log");
        let (started_tx, started_rx) = unbounded();
        let finished = Arc::new(Mutex::new(false));

        let done = finished.clone();
        let registration = f
            .service
            .add_file(&file, move || {
                let _ = started_tx.send(());
                std::thread::sleep(Duration::from_millis(200));
                *done.lock() = true;
            })
            .unwrap();

        f.modify(&file);
        started_rx.recv_timeout(WAIT).unwrap();
        drop(registration);

        assert!(*finished.lock());
        assert!(!f.service.stats().dispatcher_running);
    }

    #[test]
    fn test_overflow_notifies_every_subscriber() {
        let f = fixture();
        let (rx_a, callback_a) = signal();
        let _a = f
            .service
            .add_file(f.existing_file("a.log"), callback_a)
            .unwrap();
        let (rx_b, callback_b) = signal();
        let _b = f.service.add_file(f.dir.join("b.log"), callback_b).unwrap();

        f.source.push_overflow();

        rx_a.recv_timeout(WAIT).unwrap();
        rx_b.recv_timeout(WAIT).unwrap();
    }

    #[test]
    fn test_source_failure_degrades_service() {
        let f = fixture();
        let file = f.existing_file("app.log");
        let (rx, callback) = signal();
        let _registration = f.service.add_file(&file, callback).unwrap();

        f.source.fail("inotify read failed");
        assert!(wait_until(|| !f.service.health().is_healthy()));

        match f.service.health() {
            WatchHealth::Degraded { reason, .. } => assert_eq!(reason, "inotify read failed"),
            WatchHealth::Healthy => unreachable!(),
        }

        f.modify(&file);
        assert!(rx.recv_timeout(QUIET).is_err());

        let result = f.service.add_file(f.dir.join("other.log"), || {});
        assert!(matches!(result, Err(WatchError::Degraded(_))));
    }

    #[test]
    fn test_panicking_callback_does_not_stop_delivery() {
        let f = fixture();
        let file = f.existing_file("app.log");
        let _panics = f
            .service
            .add_file(&file, || panic!("callback failure"))
            .unwrap();
        let (rx, callback) = signal();
        let _counts = f.service.add_file(&file, callback).unwrap();

        f.modify(&file);
        rx.recv_timeout(WAIT).unwrap();
        f.modify(&file);
        rx.recv_timeout(WAIT).unwrap();
        assert!(f.service.health().is_healthy());
    }

    #[test]
    fn test_registration_outlives_service() {
        let f = fixture();
        let file = f.existing_file("app.log");
        let registration = f.service.add_file(&file, || {}).unwrap();
        let source = f.source.clone();

        drop(f.service);
        assert!(!registration.is_active());
        assert!(source.watches().is_empty());

        drop(registration);
    }

    #[test]
    fn test_no_callbacks_after_service_drop() {
        let f = fixture();
        let file = f.existing_file("app.log");
        let (rx, callback) = signal();
        let _registration = f.service.add_file(&file, callback).unwrap();
        let handle = f.source.handle_for(&file, WatchKind::File).unwrap();
        let source = f.source.clone();

        drop(f.service);
        source.push_batch(vec![RawEvent::direct(handle, EventCategory::Modified)]);

        assert!(rx.recv_timeout(QUIET).is_err());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let source = Arc::new(ScriptedSource::new());
        let config = WatchConfig::new().with_thread_name("");

        let result = WatchService::with_source(source, config);
        assert!(matches!(result, Err(WatchError::Config(_))));
    }

    #[test]
    fn test_missing_parent_directory_is_unwatchable() {
        let f = fixture();

        let result = f.service.add_file(f.dir.join("missing").join("app.log"), || {});
        assert!(matches!(result, Err(WatchError::PathUnwatchable { .. })));
        assert!(!f.service.stats().dispatcher_running);
    }

    #[test]
    fn test_health_serializes_with_status_tag() {
        let json = serde_json::to_value(WatchHealth::Healthy).unwrap();
        assert_eq!(json, serde_json::json!({ "status": "healthy" }));
    }
}
