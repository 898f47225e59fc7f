use std::fmt;
use std::sync::Arc;

use foldhash::{HashMap, HashMapExt};
use parking_lot::Mutex;
use tracing::trace;

use crate::{Call, Group, GroupId, NotificationKind, Work};

struct Pending<L: ?Sized> {
    call: Call<L>,
    stamp: u64,
}

/// The most recent not-yet-delivered update for one group. Shared with the work item that
/// will deliver it.
type PendingSlot<L> = Arc<Mutex<Option<Pending<L>>>>;

/// Outcome of [`Proxy::supersede()`].
pub(crate) enum Supersede<L: ?Sized> {
    /// Nothing was pending. The work must be handed to the group's queue.
    Enqueue(Work),

    /// A pending update was replaced. The superseded call may be the last reference to its
    /// closure, so it must be dropped without any registry lock held.
    Replaced(Call<L>),
}

/// Consolidates updates of one [`NotificationKind`] so that each group has at most one pending
/// update of that kind on its queue.
pub(crate) struct Proxy<L: ?Sized> {
    kind: NotificationKind,
    slots: Mutex<HashMap<GroupId, PendingSlot<L>>>,
}

impl<L: ?Sized + Send + Sync + 'static> Proxy<L> {
    pub(crate) fn new(kind: NotificationKind) -> Self {
        Self {
            kind,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Makes `call` the pending update for `group`.
    ///
    /// If an earlier update is still waiting on the group's queue, it is replaced in place: the
    /// work already queued will deliver `call` instead. Otherwise the returned work must be
    /// handed to the group's queue.
    pub(crate) fn supersede(
        &self,
        group: &Arc<Group<L>>,
        call: &Call<L>,
        stamp: u64,
    ) -> Supersede<L> {
        let slot = Arc::clone(
            self.slots
                .lock()
                .entry(group.id())
                .or_insert_with(|| Arc::new(Mutex::new(None))),
        );

        let replaced = slot.lock().replace(Pending {
            call: call.clone(),
            stamp,
        });

        if let Some(replaced) = replaced {
            trace!(
                kind = %self.kind,
                group = group.id(),
                superseded_stamp = replaced.stamp,
                stamp,
                "consolidated pending update"
            );

            return Supersede::Replaced(replaced.call);
        }

        let group = Arc::clone(group);

        Supersede::Enqueue(Box::new(move || {
            // Take it out first, so an update arriving while we deliver queues fresh work.
            let pending = slot.lock().take();

            if let Some(pending) = pending {
                group.deliver(&pending.call, pending.stamp);
            }
        }))
    }

    /// Discards the slot of a group that no longer exists. Work already queued for it still
    /// holds the slot and finds the group empty.
    pub(crate) fn forget(&self, group: GroupId) {
        self.slots.lock().remove(&group);
    }

    #[cfg(test)]
    pub(crate) fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }
}

impl<L: ?Sized> fmt::Debug for Proxy<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("kind", &self.kind)
            .field("groups", &self.slots.lock().len())
            .finish()
    }
}
