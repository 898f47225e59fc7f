use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use smallvec::SmallVec;
use tracing::warn;

use crate::{Call, CallQueue, DispatchMode, Work};

/// Recipient lists up to this length are collected without a heap allocation.
const INLINE_RECIPIENTS: usize = 8;

/// Identifies a registered listener by the address of its allocation.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) struct ListenerId(usize);

impl ListenerId {
    pub(crate) fn of<L: ?Sized>(listener: &Arc<L>) -> Self {
        Self(Arc::as_ptr(listener).cast::<()>().addr())
    }
}

/// Identifies a group for the lifetime of a registry. Never reused, unlike queue addresses.
pub(crate) type GroupId = u64;

/// One registration of a listener.
struct Entry<L: ?Sized> {
    listener: Arc<L>,
    id: ListenerId,

    /// Only calls stamped after this point reach the listener.
    registered_at: u64,

    /// Cleared on removal. Work that was already queued checks this before invoking.
    active: AtomicBool,
}

impl<L: ?Sized> Entry<L> {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// The listeners registered on one call queue.
pub(crate) struct Group<L: ?Sized> {
    id: GroupId,
    queue: Arc<dyn CallQueue>,

    // In registration order.
    entries: RwLock<Vec<Arc<Entry<L>>>>,
}

impl<L: ?Sized + Send + Sync + 'static> Group<L> {
    pub(crate) fn new(id: GroupId, queue: Arc<dyn CallQueue>) -> Self {
        Self {
            id,
            queue,
            entries: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn id(&self) -> GroupId {
        self.id
    }

    pub(crate) fn queue(&self) -> &Arc<dyn CallQueue> {
        &self.queue
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub(crate) fn add(&self, listener: Arc<L>, registered_at: u64) {
        let id = ListenerId::of(&listener);

        self.entries.write().push(Arc::new(Entry {
            listener,
            id,
            registered_at,
            active: AtomicBool::new(true),
        }));
    }

    /// Removes the listener and returns whether the group is now empty.
    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write();

        let position = entries
            .iter()
            .position(|entry| entry.id == id)
            .expect("registry index and group membership are updated together");

        let entry = entries.remove(position);
        entry.active.store(false, Ordering::Release);

        entries.is_empty()
    }

    /// Invokes `call` for every listener that was registered before the call was stamped and
    /// is still registered.
    ///
    /// Runs on the group's call queue.
    pub(crate) fn deliver(&self, call: &Call<L>, stamp: u64) {
        // Listener code must never run under our lock: it may add or remove listeners.
        let recipients = self
            .entries
            .read()
            .iter()
            .filter(|entry| entry.registered_at < stamp)
            .map(Arc::clone)
            .collect::<SmallVec<[_; INLINE_RECIPIENTS]>>();

        for entry in recipients {
            // A listener removed by an earlier recipient of this same call receives nothing.
            if entry.is_active() {
                call.invoke(&entry.listener);
            }
        }
    }

    /// Invokes `call` for one listener if it is still registered and predates the call.
    ///
    /// Runs on the group's call queue.
    pub(crate) fn deliver_to(&self, call: &Call<L>, stamp: u64, target: ListenerId) {
        let recipient = self
            .entries
            .read()
            .iter()
            .find(|entry| entry.id == target && entry.registered_at < stamp)
            .map(Arc::clone);

        if let Some(entry) = recipient.filter(|entry| entry.is_active()) {
            call.invoke(&entry.listener);
        }
    }

    /// Hands `work` to the group's queue.
    ///
    /// A closed queue means its listeners were not removed before it shut down. The work is
    /// dropped and the condition logged, since no listener on that queue can run anyway.
    pub(crate) fn hand_over(&self, work: Work, mode: DispatchMode) {
        if let Err(error) = self.queue.try_enqueue(work) {
            warn!(group = self.id, %error, "dropped notification for group on a closed queue");
            return;
        }

        self.synchronize_if_current(mode);
    }

    /// With [`DispatchMode::CallIfCurrent`], runs the queue's pending work if the calling thread
    /// is the queue's own context.
    pub(crate) fn synchronize_if_current(&self, mode: DispatchMode) {
        if mode == DispatchMode::CallIfCurrent && self.queue.is_current() {
            self.queue.synchronize();
        }
    }
}

impl<L: ?Sized> fmt::Debug for Group<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.id)
            .field("queue", &self.queue.id())
            .field("listeners", &self.entries.read().len())
            .finish()
    }
}
