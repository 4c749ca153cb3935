//! Background thread turning raw kernel events into callback invocations.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::{debug, error, info, warn};

use crate::entry::Callback;
use crate::error::{Result, WatchError};
use crate::event::RawEvent;
use crate::service::Shared;
use crate::source::NextBatch;

/// A running dispatcher thread.
pub(crate) struct DispatcherHandle {
    stop: Sender<()>,
    /// Disconnects when the thread exits.
    exited: Receiver<()>,
    thread: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Ask the loop to exit after its current batch. Does not wait.
    pub fn signal_stop(&self) {
        // Full means a stop is already pending; disconnected means the
        // thread is gone.
        let _ = self.stop.try_send(());
    }

    /// Signal and wait for the thread, unless called from the thread itself.
    pub fn stop_and_join(self) {
        self.signal_stop();
        join(self.thread);
    }

    /// Whether the thread is still running its loop.
    pub fn is_running(&self) -> bool {
        !self.thread.is_finished()
    }

    /// Whether this is the dispatcher thread, e.g. inside a callback.
    pub fn is_current(&self) -> bool {
        self.thread.thread().id() == thread::current().id()
    }

    /// Split into the thread, for a later join, and a receiver that
    /// disconnects once the thread has exited.
    pub fn retire(self) -> (JoinHandle<()>, Receiver<()>) {
        (self.thread, self.exited)
    }
}

/// Wait for a dispatcher thread to finish. A thread cannot join itself, so
/// from the dispatcher thread this only detaches it.
pub(crate) fn join(thread: JoinHandle<()>) {
    if thread.thread().id() == thread::current().id() {
        debug!("Dispatcher stopped from its own thread, not joining");
        return;
    }
    if thread.join().is_err() {
        error!("Dispatcher thread panicked");
    }
}

/// Start a dispatcher thread.
///
/// `predecessors` are dispatchers that were told to stop but not joined;
/// the new thread waits for them before reading events so only one loop
/// consumes the source at a time.
pub(crate) fn spawn(
    shared: Arc<Shared>,
    predecessors: Vec<JoinHandle<()>>,
) -> Result<DispatcherHandle> {
    let (stop_tx, stop_rx) = bounded(1);
    let (exited_tx, exited_rx) = bounded::<()>(0);
    let thread = thread::Builder::new()
        .name(shared.config().thread_name.clone())
        .spawn(move || {
            let _exited = exited_tx;
            for predecessor in predecessors {
                join(predecessor);
            }
            run(&shared, &stop_rx);
        })
        .map_err(WatchError::Io)?;

    Ok(DispatcherHandle {
        stop: stop_tx,
        exited: exited_rx,
        thread,
    })
}

fn run(shared: &Shared, stop: &Receiver<()>) {
    info!("File watcher dispatcher started");

    loop {
        match shared.source().next_batch(stop) {
            NextBatch::Stopped => break,
            NextBatch::Events(mut events) => {
                if shared.config().coalesce_events {
                    events.dedup();
                }
                dispatch_batch(shared, &events);
            }
            NextBatch::Overflow => {
                warn!("Events were lost, re-reading every watched path");
                deliver(shared.resync());
            }
            NextBatch::Failed(reason) => {
                shared.degrade(&reason);
                break;
            }
        }
    }

    info!("File watcher dispatcher stopped");
}

fn dispatch_batch(shared: &Shared, events: &[RawEvent]) {
    for event in events {
        // Callbacks for one event run before the next event is applied, and
        // never under the registry lock.
        let callbacks = shared.dispatch(event);
        if !callbacks.is_empty() {
            debug!(
                "{:?} on {} -> {} callback(s)",
                event.category,
                event.handle,
                callbacks.len()
            );
        }
        deliver(callbacks);
    }
}

fn deliver(callbacks: Vec<Callback>) {
    for callback in callbacks {
        if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
            warn!("File change callback panicked");
        }
    }
}
