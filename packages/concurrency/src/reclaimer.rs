//! Background destruction of released shared objects.

use std::any::type_name;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::StaticObject;

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(50);
const DEFAULT_THREAD_NAME: &str = "reclaimer";

type Garbage = Box<dyn Send>;

static GLOBAL: StaticObject<Reclaimer> = StaticObject::new(Reclaimer::new);

/// Destroys objects on a background thread so that releasing the last reference on a
/// latency-sensitive thread never pays for teardown.
///
/// The worker thread is started on demand and exits again once it has been idle for the
/// configured timeout, so an idle reclaimer has no thread at all.
///
/// Call [`shutdown()`][1] before process exit to make sure every pending object has been
/// destroyed. After shutdown, objects handed to the reclaimer are destroyed inline.
///
/// [1]: Self::shutdown
pub struct Reclaimer {
    inner: Arc<ReclaimerInner>,
}

struct ReclaimerInner {
    sender: Sender<Garbage>,
    receiver: Receiver<Garbage>,

    /// Objects handed to us but not yet destroyed, including any being destroyed right now.
    pending: AtomicUsize,

    /// Spawning a worker and a worker deciding to exit are serialized by this lock.
    worker: Mutex<WorkerState>,

    shut_down: AtomicBool,

    idle_timeout: Duration,
    thread_name: String,
}

#[derive(Default)]
struct WorkerState {
    running: bool,

    /// Handle of the current worker, or of one that exited and has not been joined yet.
    handle: Option<JoinHandle<()>>,
}

impl Reclaimer {
    /// Creates a reclaimer with default settings.
    ///
    /// Use [`Reclaimer::builder()`] for custom configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a builder for configuring the reclaimer.
    #[must_use]
    pub fn builder() -> ReclaimerBuilder {
        ReclaimerBuilder::new()
    }

    /// The process-wide reclaimer used by [`SharedObject::destroy()`][crate::SharedObject::destroy]
    /// unless a type overrides it.
    pub fn global() -> &'static Self {
        GLOBAL.get()
    }

    /// Schedules `object` for destruction on the worker thread.
    pub fn reclaim<T: Send + 'static>(&self, object: T) {
        if self.inner.shut_down.load(Ordering::Acquire) {
            trace!(
                object_type = type_name::<T>(),
                "reclaimer is shut down, destroying inline"
            );
            drop(object);
            return;
        }

        self.inner.pending.fetch_add(1, Ordering::AcqRel);

        self.inner
            .sender
            .send(Box::new(object))
            .expect("the reclaimer owns both ends of its channel, so it cannot be disconnected");

        // Must come after the send: a worker that is about to exit re-checks the channel
        // under the same lock, so either it sees our object or we see it gone.
        self.inner.ensure_worker();
    }

    /// Blocks until every object handed to the reclaimer so far has been destroyed.
    ///
    /// Objects the worker has not picked up yet are destroyed on the calling thread.
    pub fn flush(&self) {
        let backoff = Backoff::new();

        loop {
            while let Ok(garbage) = self.inner.receiver.try_recv() {
                self.inner.destroy(garbage);
            }

            // Whatever is left is being destroyed by the worker right now.
            if self.inner.pending.load(Ordering::Acquire) == 0 {
                return;
            }

            backoff.snooze();
        }
    }

    /// Destroys everything pending, waits for the worker thread to exit and switches to inline
    /// destruction from now on.
    ///
    /// The worker exits once its idle timeout elapses, so this may block for that long.
    #[cfg_attr(test, mutants::skip)] // Mutations only leave the worker idling.
    pub fn shutdown(&self) {
        debug!(
            thread_name = %self.inner.thread_name,
            "reclaimer shutting down"
        );

        self.inner.shut_down.store(true, Ordering::Release);
        self.flush();

        // Take the handle out first: the worker needs the lock to exit.
        let handle = self.inner.worker.lock().handle.take();

        if let Some(handle) = handle {
            join_worker(handle);
        }

        // Anything that raced with the shut_down flag is destroyed here.
        self.flush();
    }

    /// Number of objects scheduled for destruction that have not been destroyed yet.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Whether a worker thread is currently running.
    #[must_use]
    pub fn has_worker(&self) -> bool {
        self.inner.worker.lock().running
    }
}

impl Default for Reclaimer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Reclaimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("pending", &self.pending())
            .field("has_worker", &self.has_worker())
            .field("idle_timeout", &self.inner.idle_timeout)
            .field("thread_name", &self.inner.thread_name)
            .finish_non_exhaustive()
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ReclaimerInner {
    fn ensure_worker(self: &Arc<Self>) {
        let mut worker = self.worker.lock();

        if worker.running {
            return;
        }

        // A worker that exited on its own has already released the lock, so this is quick.
        if let Some(finished) = worker.handle.take() {
            join_worker(finished);
        }

        let inner = Arc::clone(self);

        let handle = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || {
                debug!("reclaimer worker started");
                inner.worker_loop();
                debug!("reclaimer worker exiting");
            })
            .expect("failed to spawn reclaimer thread: thread spawning failure is not supported");

        worker.running = true;
        worker.handle = Some(handle);
    }

    fn worker_loop(&self) {
        loop {
            match self.receiver.recv_timeout(self.idle_timeout) {
                Ok(garbage) => self.destroy(garbage),
                Err(RecvTimeoutError::Timeout) => {
                    let mut worker = self.worker.lock();

                    // Re-check under the lock to avoid losing an object sent just now.
                    if self.receiver.is_empty() {
                        worker.running = false;
                        return;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.worker.lock().running = false;
                    return;
                }
            }
        }
    }

    fn destroy(&self, garbage: Garbage) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || drop(garbage))) {
            let panic_message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_default();

            error!(%panic_message, "destructor panicked during reclamation");
        }

        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

fn join_worker(handle: JoinHandle<()>) {
    if let Err(payload) = handle.join() {
        // The worker catches panics from destructors, so this means the reclaimer
        // itself is broken and we must not hide it.
        panic::resume_unwind(payload);
    }
}

/// Builder for configuring a [`Reclaimer`].
#[derive(Debug)]
pub struct ReclaimerBuilder {
    idle_timeout: Duration,
    thread_name: String,
}

impl ReclaimerBuilder {
    fn new() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }

    /// How long the worker thread waits for more work before exiting.
    ///
    /// Default is 50 milliseconds.
    #[must_use]
    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Name of the worker thread.
    #[must_use]
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Builds the reclaimer. No thread is started until there is something to destroy.
    #[must_use]
    pub fn build(self) -> Reclaimer {
        let (sender, receiver) = channel::unbounded();

        Reclaimer {
            inner: Arc::new(ReclaimerInner {
                sender,
                receiver,
                pending: AtomicUsize::new(0),
                worker: Mutex::new(WorkerState::default()),
                shut_down: AtomicBool::new(false),
                idle_timeout: self.idle_timeout,
                thread_name: self.thread_name,
            }),
        }
    }
}
