use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};

use crossbeam::queue::SegQueue;
use parking_lot::{Mutex, ReentrantMutex};
use tracing::trace;

use crate::{CallQueue, Error, QueueId, Result, Work};

/// A call queue whose work runs only when its owning thread calls
/// [`synchronize()`][CallQueue::synchronize].
///
/// This suits threads that already have a loop of their own, such as an audio callback or a UI
/// event loop, and want to process notifications at a point of their choosing. The owner is the
/// thread that created the queue until [`associate_with_current_thread()`][1] moves it.
///
/// Appending work is lock-free and can be done from any thread.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicU32, Ordering};
///
/// use listeners::{CallQueue, ManualCallQueue};
///
/// let queue = ManualCallQueue::new("ui");
/// let counter = Arc::new(AtomicU32::new(0));
///
/// let counter_clone = Arc::clone(&counter);
/// queue.enqueue(Box::new(move || {
///     counter_clone.fetch_add(1, Ordering::Relaxed);
/// }));
///
/// assert_eq!(counter.load(Ordering::Relaxed), 0);
/// assert!(queue.synchronize());
/// assert_eq!(counter.load(Ordering::Relaxed), 1);
/// ```
///
/// [1]: Self::associate_with_current_thread
pub struct ManualCallQueue {
    id: QueueId,
    name: String,
    owner: Mutex<ThreadId>,
    pending: SegQueue<Work>,
    closed: AtomicBool,

    // Held while draining. Re-entrant, so work that synchronizes its own queue keeps draining.
    drain: ReentrantMutex<()>,
}

impl ManualCallQueue {
    /// Creates a queue owned by the calling thread.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: QueueId::next(),
            name: name.into(),
            owner: Mutex::new(thread::current().id()),
            pending: SegQueue::new(),
            closed: AtomicBool::new(false),
            drain: ReentrantMutex::new(()),
        }
    }

    /// Makes the calling thread the one that executes this queue's work.
    ///
    /// If the previous owner is inside [`synchronize()`][CallQueue::synchronize], it finishes
    /// the work item it is running and leaves the rest to the new owner, whose own
    /// `synchronize()` waits for that item to complete. Work never runs on two threads at once.
    pub fn associate_with_current_thread(&self) {
        *self.owner.lock() = thread::current().id();
    }

    /// Stops accepting new work. Work already queued still runs on the next synchronize.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Whether the queue has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of work items waiting for the next synchronize.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Name given to the queue at creation, for diagnostics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl CallQueue for ManualCallQueue {
    fn id(&self) -> QueueId {
        self.id
    }

    fn is_current(&self) -> bool {
        *self.owner.lock() == thread::current().id()
    }

    fn try_enqueue(&self, work: Work) -> Result<()> {
        if self.is_closed() {
            return Err(Error::QueueClosed { queue: self.id });
        }

        self.pending.push(work);
        Ok(())
    }

    fn synchronize(&self) -> bool {
        if !self.is_current() {
            return false;
        }

        let _draining = self.drain.lock();

        let mut executed = 0_usize;

        // Work that enqueues more work onto this queue is picked up in the same pass. Ownership
        // may move to another thread between items.
        while self.is_current() {
            let Some(work) = self.pending.pop() else {
                break;
            };

            work();
            executed = executed.wrapping_add(1);
        }

        if executed > 0 {
            trace!(queue = %self.id, name = %self.name, executed, "synchronized call queue");
        }

        executed > 0
    }
}

impl fmt::Debug for ManualCallQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualCallQueue")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("pending", &self.pending.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
