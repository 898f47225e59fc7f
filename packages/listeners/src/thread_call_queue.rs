use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error};

use crate::{CallQueue, Error, QueueId, Result, Work};

/// A call queue served by a dedicated worker thread.
///
/// Work runs on the worker in the order it was accepted. A work item that panics is logged and
/// discarded, and the worker moves on to the next item.
///
/// Dropping the queue closes it: new work is refused, the worker finishes everything already
/// accepted, and the drop waits for the worker to exit.
///
/// # Example
///
/// ```rust
/// use std::sync::mpsc;
///
/// use listeners::{CallQueue, ThreadCallQueue};
///
/// let queue = ThreadCallQueue::new("background");
/// let (tx, rx) = mpsc::channel();
///
/// queue.enqueue(Box::new(move || tx.send(42).unwrap()));
///
/// assert_eq!(rx.recv().unwrap(), 42);
/// ```
pub struct ThreadCallQueue {
    id: QueueId,
    name: String,

    // None once closed. Dropping the last sender lets the worker run dry and exit.
    sender: RwLock<Option<Sender<Work>>>,

    // Used by synchronize() on the worker thread to run work ahead of the worker loop.
    receiver: Receiver<Work>,

    worker_thread: ThreadId,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadCallQueue {
    /// Starts a worker thread with the given name and returns the queue it serves.
    ///
    /// # Panics
    ///
    /// Panics if the operating system refuses to create the thread.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let id = QueueId::next();
        let name = name.into();
        let (sender, receiver) = channel::unbounded::<Work>();

        let worker = thread::Builder::new()
            .name(name.clone())
            .spawn({
                let receiver = receiver.clone();
                let name = name.clone();

                move || {
                    debug!(queue = %id, %name, "call queue worker started");

                    for work in receiver.iter() {
                        run_work(work, id);
                    }

                    debug!(queue = %id, %name, "call queue worker exiting");
                }
            })
            .expect("failed to spawn call queue worker: thread spawning failure is not supported");

        Self {
            id,
            name,
            sender: RwLock::new(Some(sender)),
            receiver,
            worker_thread: worker.thread().id(),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Stops accepting new work and waits for the worker to finish what was already accepted.
    ///
    /// Called from the worker thread itself, this only stops accepting work. The worker exits
    /// after the current item and the remaining queued items complete.
    ///
    /// Calling this more than once has no further effect.
    pub fn close(&self) {
        // Take the sender out of the lock before dropping it, so concurrent enqueuers are not
        // blocked while the channel disconnects.
        let sender = self.sender.write().take();
        drop(sender);

        if self.is_current() {
            return;
        }

        let worker = self.worker.lock().take();

        let Some(worker) = worker else {
            return;
        };

        if let Err(payload) = worker.join() {
            // Work items run inside a panic trap, so this is an infrastructure failure.
            panic::resume_unwind(payload);
        }
    }

    /// Whether the queue has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.read().is_none()
    }

    /// Name of the worker thread.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

fn run_work(work: Work, queue: QueueId) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(work)) {
        let panic_message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_default();

        error!(queue = %queue, %panic_message, "call queue work item panicked");
    }
}

impl CallQueue for ThreadCallQueue {
    fn id(&self) -> QueueId {
        self.id
    }

    fn is_current(&self) -> bool {
        thread::current().id() == self.worker_thread
    }

    fn try_enqueue(&self, work: Work) -> Result<()> {
        let sender = self.sender.read();

        let Some(sender) = sender.as_ref() else {
            return Err(Error::QueueClosed { queue: self.id });
        };

        // We hold a receiver ourselves, so the channel cannot be disconnected from that side.
        sender
            .send(work)
            .map_err(|_disconnected| Error::QueueClosed { queue: self.id })
    }

    fn synchronize(&self) -> bool {
        if !self.is_current() {
            return false;
        }

        let mut executed = false;

        while let Ok(work) = self.receiver.try_recv() {
            run_work(work, self.id);
            executed = true;
        }

        executed
    }
}

impl Drop for ThreadCallQueue {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ThreadCallQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadCallQueue")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("pending", &self.receiver.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    use static_assertions::assert_impl_all;
    use testing::with_watchdog;

    use super::*;

    assert_impl_all!(ThreadCallQueue: Send, Sync);

    #[cfg_attr(miri, ignore)] // Spawns threads, too slow under Miri.
    #[test]
    fn work_runs_on_named_worker_in_order() {
        with_watchdog(|| {
            let queue = ThreadCallQueue::new("test-call-queue");
            let (tx, rx) = mpsc::channel();

            for value in 0..10 {
                let tx = tx.clone();

                queue.enqueue(Box::new(move || {
                    let name = thread::current().name().map(str::to_string);
                    tx.send((value, name)).unwrap();
                }));
            }

            for expected in 0..10 {
                let (value, name) = rx.recv().unwrap();

                assert_eq!(value, expected);
                assert_eq!(name.as_deref(), Some("test-call-queue"));
            }
        });
    }

    #[cfg_attr(miri, ignore)] // Spawns threads, too slow under Miri.
    #[test]
    fn is_current_only_on_worker() {
        with_watchdog(|| {
            let queue = Arc::new(ThreadCallQueue::new("test-call-queue"));
            let (tx, rx) = mpsc::channel();

            assert!(!queue.is_current());
            assert!(!queue.synchronize());

            queue.enqueue(Box::new({
                let queue = Arc::clone(&queue);
                move || tx.send(queue.is_current()).unwrap()
            }));

            assert!(rx.recv().unwrap());
        });
    }

    #[cfg_attr(miri, ignore)] // Spawns threads, too slow under Miri.
    #[test]
    fn run_if_current_on_worker_runs_before_returning() {
        with_watchdog(|| {
            let queue = Arc::new(ThreadCallQueue::new("test-call-queue"));
            let log = Arc::new(Mutex::new(Vec::new()));
            let (tx, rx) = mpsc::channel();

            queue.enqueue(Box::new({
                let queue = Arc::clone(&queue);
                let log = Arc::clone(&log);

                move || {
                    log.lock().push("outer-start");

                    queue.run_if_current(Box::new({
                        let log = Arc::clone(&log);
                        move || log.lock().push("inner")
                    }));

                    log.lock().push("outer-end");
                    tx.send(()).unwrap();
                }
            }));

            rx.recv().unwrap();
            assert_eq!(*log.lock(), vec!["outer-start", "inner", "outer-end"]);
        });
    }

    #[cfg_attr(miri, ignore)] // Spawns threads, too slow under Miri.
    #[test]
    fn panicking_work_does_not_stop_worker() {
        with_watchdog(|| {
            let queue = ThreadCallQueue::new("test-call-queue");
            let (tx, rx) = mpsc::channel();

            queue.enqueue(Box::new(|| panic!("work item failure")));
            queue.enqueue(Box::new(move || tx.send(()).unwrap()));

            rx.recv().unwrap();
        });
    }

    #[cfg_attr(miri, ignore)] // Spawns threads, too slow under Miri.
    #[test]
    fn close_drains_accepted_work_and_refuses_more() {
        with_watchdog(|| {
            let queue = ThreadCallQueue::new("test-call-queue");
            let executed = Arc::new(AtomicUsize::new(0));

            for _ in 0..100 {
                let executed = Arc::clone(&executed);

                queue.enqueue(Box::new(move || {
                    executed.fetch_add(1, Ordering::Relaxed);
                }));
            }

            queue.close();

            assert!(queue.is_closed());
            assert_eq!(executed.load(Ordering::Relaxed), 100);

            let result = queue.try_enqueue(Box::new(|| {}));
            assert!(matches!(result, Err(Error::QueueClosed { .. })));

            // Closing again is harmless.
            queue.close();
        });
    }

    #[cfg_attr(miri, ignore)] // Spawns threads, too slow under Miri.
    #[test]
    fn close_from_worker_does_not_deadlock() {
        with_watchdog(|| {
            let queue = Arc::new(ThreadCallQueue::new("test-call-queue"));
            let (tx, rx) = mpsc::channel();

            queue.enqueue(Box::new({
                let queue = Arc::clone(&queue);

                move || {
                    queue.close();
                    tx.send(queue.is_closed()).unwrap();
                }
            }));

            assert!(rx.recv().unwrap());
        });
    }
}
