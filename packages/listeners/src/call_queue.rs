use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::Result;

/// A unit of deferred work handed to a [`CallQueue`].
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Identifies a call queue. Unique within the process.
///
/// The listener registry groups listeners by the identity of the queue they registered on.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct QueueId(u64);

impl QueueId {
    /// Allocates a new process-unique identifier. Queue implementations call this once when
    /// they are created.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);

        // Relaxed is enough: we only need uniqueness, not ordering with other memory.
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A single logical execution context that runs deferred work in FIFO order.
///
/// Work is either queued for later execution on the owning context, or - when the caller is
/// already running on the owning context - executed before the call returns.
///
/// Implementations must run work items one at a time, in the order they were accepted.
pub trait CallQueue: Send + Sync + fmt::Debug + 'static {
    /// The identity of this queue.
    fn id(&self) -> QueueId;

    /// Whether the calling thread is the context that executes this queue's work.
    fn is_current(&self) -> bool;

    /// Appends `work` to the queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueClosed`][crate::Error::QueueClosed] if the queue no longer accepts
    /// work. The work is dropped without running.
    fn try_enqueue(&self, work: Work) -> Result<()>;

    /// Runs all pending work if called from the owning context. Returns whether any work ran.
    ///
    /// Called from any other thread, this does nothing and returns `false`.
    fn synchronize(&self) -> bool;

    /// Appends `work` to the queue.
    ///
    /// # Panics
    ///
    /// Panics if the queue is closed. Listeners must be removed before their queue is closed,
    /// so this indicates a programming error.
    fn enqueue(&self, work: Work) {
        if let Err(error) = self.try_enqueue(work) {
            panic!("{error}");
        }
    }

    /// Appends `work` to the queue and, if the caller is on the owning context, runs everything
    /// pending - including `work` - before returning.
    ///
    /// Work queued earlier still runs first, so FIFO order is preserved.
    ///
    /// # Panics
    ///
    /// Panics if the queue is closed.
    fn run_if_current(&self, work: Work) {
        self.enqueue(work);

        if self.is_current() {
            self.synchronize();
        }
    }
}
