use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use foldhash::{HashMap, HashMapExt};
use parking_lot::RwLock;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::{
    Call, CallPool, CallQueue, DEFAULT_CALL_POOL_CAPACITY, Group, ListenerId, NotificationKind,
    Proxy, Supersede, Work,
};

/// Work lists up to this length are collected without a heap allocation.
const INLINE_GROUPS: usize = 8;

/// How a notification is handed to each listener's call queue.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum DispatchMode {
    /// Always append the notification to the queue, even when the dispatching thread is the
    /// queue's own context.
    Queue,

    /// Append the notification to the queue and, if the dispatching thread is the queue's own
    /// context, run the queue's pending work before returning.
    CallIfCurrent,
}

struct GroupSet<L: ?Sized> {
    // In creation order.
    groups: Vec<Arc<Group<L>>>,
    by_listener: HashMap<ListenerId, Arc<Group<L>>>,
}

/// A thread-safe registry of listeners, each bound to the call queue its notifications run on.
///
/// Listeners that share a call queue form a group. A notification is allocated once as a pooled
/// [`Call`], then handed to every group's queue, where it is applied to each listener of the
/// group in registration order.
///
/// # Guarantees
///
/// * A listener never receives a notification dispatched before its [`add()`][1] returned.
/// * After [`remove()`][2] returns, no new notification reaches the listener. A notification that
///   is already running may finish, but queued ones are skipped.
/// * Notifications dispatched one after another from the same thread arrive at each listener in
///   that order.
/// * [`update()`][3] replaces a pending notification of the same [`NotificationKind`] that has
///   not yet run, so a slow listener sees only the latest state.
///
/// Locks are only held while the registry's own bookkeeping changes. Listener code always runs
/// on its call queue with no registry lock held, so listeners may add or remove listeners from
/// inside a notification.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicU32, Ordering};
///
/// use listeners::{CallQueue, Listeners, ManualCallQueue};
///
/// trait Progress: Send + Sync {
///     fn progress_changed(&self, percent: u32);
/// }
///
/// struct LastSeen(AtomicU32);
///
/// impl Progress for LastSeen {
///     fn progress_changed(&self, percent: u32) {
///         self.0.store(percent, Ordering::Relaxed);
///     }
/// }
///
/// let listeners = Listeners::<dyn Progress>::new();
/// let queue = Arc::new(ManualCallQueue::new("ui"));
///
/// let last_seen = Arc::new(LastSeen(AtomicU32::new(0)));
/// listeners.add(
///     Arc::clone(&last_seen) as Arc<dyn Progress>,
///     Arc::clone(&queue) as Arc<dyn CallQueue>,
/// );
///
/// listeners.queue(|listener| listener.progress_changed(50));
/// listeners.queue(|listener| listener.progress_changed(100));
///
/// assert_eq!(last_seen.0.load(Ordering::Relaxed), 0);
/// queue.synchronize();
/// assert_eq!(last_seen.0.load(Ordering::Relaxed), 100);
/// ```
///
/// [1]: Self::add
/// [2]: Self::remove
/// [3]: Self::update
pub struct Listeners<L: ?Sized + Send + Sync + 'static> {
    groups: RwLock<GroupSet<L>>,
    proxies: RwLock<HashMap<NotificationKind, Arc<Proxy<L>>>>,

    // Stamped on every registration and every dispatch.
    clock: AtomicU64,

    next_group_id: AtomicU64,

    call_pool: Arc<CallPool<L>>,
}

impl<L: ?Sized + Send + Sync + 'static> Listeners<L> {
    /// Creates an empty registry with default settings.
    ///
    /// Use [`Listeners::builder()`] for custom configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a builder for configuring the registry.
    #[must_use]
    pub fn builder() -> ListenersBuilder<L> {
        ListenersBuilder::new()
    }

    fn from_builder(builder: &ListenersBuilder<L>) -> Self {
        Self {
            groups: RwLock::new(GroupSet {
                groups: Vec::new(),
                by_listener: HashMap::new(),
            }),
            proxies: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
            next_group_id: AtomicU64::new(0),
            call_pool: CallPool::new(builder.call_pool_capacity),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers `listener` to receive notifications on `queue`.
    ///
    /// The listener receives every notification dispatched after this call returns, and none
    /// dispatched before.
    ///
    /// # Panics
    ///
    /// Panics if the listener is already registered.
    pub fn add(&self, listener: Arc<L>, queue: Arc<dyn CallQueue>) {
        let id = ListenerId::of(&listener);
        let mut set = self.groups.write();

        assert!(
            !set.by_listener.contains_key(&id),
            "listener is already registered - each listener may only be added once"
        );

        let group = match set.groups.iter().find(|group| group.queue().id() == queue.id()) {
            Some(group) => Arc::clone(group),
            None => {
                let group = Arc::new(Group::new(
                    self.next_group_id.fetch_add(1, Ordering::Relaxed),
                    queue,
                ));

                debug!(group = group.id(), queue = %group.queue().id(), "created listener group");

                set.groups.push(Arc::clone(&group));
                group
            }
        };

        // Stamped under the exclusive lock, so every dispatch is either fully before or fully
        // after this registration.
        group.add(listener, self.tick());

        set.by_listener.insert(id, group);
    }

    /// Unregisters `listener`.
    ///
    /// After this returns, no new notification is delivered to the listener. Notifications that
    /// were queued but have not started are skipped when their turn comes.
    ///
    /// # Panics
    ///
    /// Panics if the listener is not registered.
    pub fn remove(&self, listener: &Arc<L>) {
        let mut set = self.groups.write();

        let Some(group) = set.by_listener.remove(&ListenerId::of(listener)) else {
            panic!("listener is not registered - it was never added or was already removed");
        };

        if !group.remove(ListenerId::of(listener)) {
            return;
        }

        set.groups.retain(|candidate| !Arc::ptr_eq(candidate, &group));

        for proxy in self.proxies.read().values() {
            proxy.forget(group.id());
        }

        debug!(group = group.id(), queue = %group.queue().id(), "pruned empty listener group");
    }

    /// Whether `listener` is currently registered.
    #[must_use]
    pub fn contains(&self, listener: &Arc<L>) -> bool {
        self.groups
            .read()
            .by_listener
            .contains_key(&ListenerId::of(listener))
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.read().by_listener.len()
    }

    /// Whether no listeners are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of distinct call queues that listeners are registered on.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.read().groups.len()
    }

    /// The pool that [`new_call()`][Self::new_call] allocates from.
    #[must_use]
    pub fn call_pool(&self) -> &Arc<CallPool<L>> {
        &self.call_pool
    }

    /// Allocates a pooled call that applies `notify` to each listener it is delivered to.
    pub fn new_call(&self, notify: impl Fn(&L) + Send + Sync + 'static) -> Call<L> {
        self.call_pool.call(notify)
    }

    /// Delivers `call` to every registered listener, through each listener's call queue.
    pub fn dispatch(&self, call: &Call<L>, mode: DispatchMode) {
        let handovers = {
            let set = self.groups.read();
            let stamp = self.tick();

            trace!(stamp, groups = set.groups.len(), ?mode, "dispatching notification");

            set.groups
                .iter()
                .map(|group| {
                    let work: Work = Box::new({
                        let group = Arc::clone(group);
                        let call = call.clone();
                        move || group.deliver(&call, stamp)
                    });

                    (Arc::clone(group), work)
                })
                .collect::<Handovers<L>>()
        };

        // With CallIfCurrent, listener code may run right here, so the lock must be gone.
        hand_over_all(handovers, mode);
    }

    /// Delivers `call` to `target` only, through its call queue.
    ///
    /// Does nothing if `target` is not registered.
    pub fn dispatch1(&self, call: &Call<L>, mode: DispatchMode, target: &Arc<L>) {
        let target = ListenerId::of(target);

        let (group, work) = {
            let set = self.groups.read();

            let Some(group) = set.by_listener.get(&target) else {
                trace!(?mode, "notification target is not registered, nothing to do");
                return;
            };

            let stamp = self.tick();

            let work: Work = Box::new({
                let group = Arc::clone(group);
                let call = call.clone();
                move || group.deliver_to(&call, stamp, target)
            });

            (Arc::clone(group), work)
        };

        group.hand_over(work, mode);
    }

    /// Delivers `call` to every registered listener, replacing any update of the same `kind`
    /// that is still waiting on a listener's call queue.
    ///
    /// A group that has a pending update of this kind receives `call` in its place, at the
    /// queue position of the pending one. A group with nothing pending gets `call` queued as
    /// with [`dispatch()`][Self::dispatch].
    pub fn update(&self, kind: NotificationKind, call: &Call<L>, mode: DispatchMode) {
        let mut handovers = Handovers::<L>::new();
        let mut superseded = SmallVec::<[(Arc<Group<L>>, Call<L>); INLINE_GROUPS]>::new();

        {
            let set = self.groups.read();
            let proxy = self.proxy(kind);
            let stamp = self.tick();

            trace!(stamp, %kind, groups = set.groups.len(), ?mode, "dispatching update");

            for group in &set.groups {
                match proxy.supersede(group, call, stamp) {
                    Supersede::Enqueue(work) => handovers.push((Arc::clone(group), work)),
                    Supersede::Replaced(replaced) => superseded.push((Arc::clone(group), replaced)),
                }
            }
        }

        hand_over_all(handovers, mode);

        // A replaced update is already on the queue, at the position of the one it replaced.
        for (group, replaced) in superseded {
            // Releasing the superseded call may run the drop code of whatever its closure
            // captured, which is free to use the registry.
            drop(replaced);
            group.synchronize_if_current(mode);
        }
    }

    fn proxy(&self, kind: NotificationKind) -> Arc<Proxy<L>> {
        if let Some(proxy) = self.proxies.read().get(&kind) {
            return Arc::clone(proxy);
        }

        Arc::clone(
            self.proxies
                .write()
                .entry(kind)
                .or_insert_with(|| Arc::new(Proxy::new(kind))),
        )
    }

    /// Notifies every listener, running the notification right away on queues owned by the
    /// calling thread.
    pub fn call(&self, notify: impl Fn(&L) + Send + Sync + 'static) {
        self.dispatch(&self.new_call(notify), DispatchMode::CallIfCurrent);
    }

    /// Notifies every listener, always deferring to their call queues.
    pub fn queue(&self, notify: impl Fn(&L) + Send + Sync + 'static) {
        self.dispatch(&self.new_call(notify), DispatchMode::Queue);
    }

    /// Notifies `target`, running the notification right away if its queue is owned by the
    /// calling thread. Does nothing if `target` is not registered.
    pub fn call1(&self, target: &Arc<L>, notify: impl Fn(&L) + Send + Sync + 'static) {
        self.dispatch1(&self.new_call(notify), DispatchMode::CallIfCurrent, target);
    }

    /// Notifies `target` through its call queue. Does nothing if `target` is not registered.
    pub fn queue1(&self, target: &Arc<L>, notify: impl Fn(&L) + Send + Sync + 'static) {
        self.dispatch1(&self.new_call(notify), DispatchMode::Queue, target);
    }

    /// Notifies every listener of the latest state of `kind`, consolidating with pending
    /// updates of the same kind.
    pub fn update_with(
        &self,
        kind: NotificationKind,
        notify: impl Fn(&L) + Send + Sync + 'static,
    ) {
        self.update(kind, &self.new_call(notify), DispatchMode::CallIfCurrent);
    }
}

type Handovers<L> = SmallVec<[(Arc<Group<L>>, Work); INLINE_GROUPS]>;

fn hand_over_all<L>(handovers: Handovers<L>, mode: DispatchMode)
where
    L: ?Sized + Send + Sync + 'static,
{
    for (group, work) in handovers {
        group.hand_over(work, mode);
    }
}

impl<L: ?Sized + Send + Sync + 'static> Default for Listeners<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ?Sized + Send + Sync + 'static> fmt::Debug for Listeners<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set = self.groups.read();

        f.debug_struct("Listeners")
            .field("listeners", &set.by_listener.len())
            .field("groups", &set.groups)
            .field("proxies", &self.proxies.read().len())
            .field("call_pool", &self.call_pool)
            .finish_non_exhaustive()
    }
}

/// Builder for creating a [`Listeners`] registry with custom configuration.
///
/// # Example
///
/// ```rust
/// use listeners::Listeners;
///
/// let listeners = Listeners::<dyn Fn(u32) + Send + Sync>::builder()
///     .call_pool_capacity(16)
///     .build();
///
/// assert!(listeners.is_empty());
/// ```
#[must_use]
pub struct ListenersBuilder<L: ?Sized> {
    call_pool_capacity: usize,
    _listener: PhantomData<fn(&L)>,
}

impl<L: ?Sized + Send + Sync + 'static> ListenersBuilder<L> {
    fn new() -> Self {
        Self {
            call_pool_capacity: DEFAULT_CALL_POOL_CAPACITY,
            _listener: PhantomData,
        }
    }

    /// Sets how many calls the pool holds before it first needs to grow.
    ///
    /// The pool grows on demand, so this only affects how soon the first growth happens.
    /// Default: 64.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn call_pool_capacity(mut self, capacity: usize) -> Self {
        assert!(capacity > 0, "call pool capacity must be at least 1");

        self.call_pool_capacity = capacity;
        self
    }

    /// Builds the registry with the configured settings.
    #[must_use]
    pub fn build(self) -> Listeners<L> {
        Listeners::from_builder(&self)
    }
}

impl<L: ?Sized> fmt::Debug for ListenersBuilder<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenersBuilder")
            .field("call_pool_capacity", &self.call_pool_capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Weak;
    use std::sync::atomic::AtomicU32;

    use parking_lot::Mutex;
    use static_assertions::assert_impl_all;
    use testing::with_watchdog;

    use super::*;
    use crate::ManualCallQueue;

    assert_impl_all!(Listeners<dyn Fn() + Send + Sync>: Send, Sync);
    assert_impl_all!(DispatchMode: Send, Sync, Copy);

    #[derive(Default)]
    struct Log(Mutex<Vec<u32>>);

    impl Log {
        fn take(&self) -> Vec<u32> {
            std::mem::take(&mut *self.0.lock())
        }
    }

    fn push(value: u32) -> impl Fn(&Log) + Send + Sync + 'static {
        move |log: &Log| log.0.lock().push(value)
    }

    fn manual_queue() -> (Arc<ManualCallQueue>, Arc<dyn CallQueue>) {
        let queue = Arc::new(ManualCallQueue::new("test"));
        let erased = Arc::clone(&queue) as Arc<dyn CallQueue>;
        (queue, erased)
    }

    #[test]
    fn groups_follow_queues() {
        let listeners = Listeners::<Log>::new();
        let (_a, queue_a) = manual_queue();
        let (_b, queue_b) = manual_queue();

        let first = Arc::new(Log::default());
        let second = Arc::new(Log::default());
        let third = Arc::new(Log::default());

        listeners.add(Arc::clone(&first), Arc::clone(&queue_a));
        listeners.add(Arc::clone(&second), Arc::clone(&queue_a));
        listeners.add(Arc::clone(&third), Arc::clone(&queue_b));

        assert_eq!(listeners.len(), 3);
        assert_eq!(listeners.group_count(), 2);
        assert!(listeners.contains(&second));

        listeners.remove(&third);
        assert_eq!(listeners.group_count(), 1);
        assert!(!listeners.contains(&third));

        listeners.remove(&first);
        listeners.remove(&second);
        assert!(listeners.is_empty());
        assert_eq!(listeners.group_count(), 0);
    }

    #[test]
    #[should_panic]
    fn duplicate_add_panics() {
        let listeners = Listeners::<Log>::new();
        let (_queue, erased) = manual_queue();
        let log = Arc::new(Log::default());

        listeners.add(Arc::clone(&log), Arc::clone(&erased));
        listeners.add(Arc::clone(&log), erased);
    }

    #[test]
    #[should_panic]
    fn remove_of_unregistered_panics() {
        let listeners = Listeners::<Log>::new();
        listeners.remove(&Arc::new(Log::default()));
    }

    #[test]
    fn queue_mode_defers_until_synchronize() {
        let listeners = Listeners::<Log>::new();
        let (queue, erased) = manual_queue();
        let log = Arc::new(Log::default());

        listeners.add(Arc::clone(&log), erased);

        listeners.queue(push(1));
        assert!(log.take().is_empty());

        queue.synchronize();
        assert_eq!(log.take(), vec![1]);
    }

    #[test]
    fn call_mode_runs_inline_on_owning_thread() {
        let listeners = Listeners::<Log>::new();
        let (queue, erased) = manual_queue();
        let log = Arc::new(Log::default());

        listeners.add(Arc::clone(&log), erased);

        listeners.queue(push(1));
        listeners.call(push(2));

        // Queued work ran first.
        assert_eq!(log.take(), vec![1, 2]);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn dispatch_with_no_listeners_is_noop() {
        let listeners = Listeners::<Log>::new();

        listeners.call(push(1));
        listeners.update_with(NotificationKind::named("test"), push(2));

        assert_eq!(listeners.call_pool().in_use(), 0);
    }

    #[test]
    fn one_call_is_shared_by_all_groups() {
        let listeners = Listeners::<Log>::new();
        let (queue_a, erased_a) = manual_queue();
        let (queue_b, erased_b) = manual_queue();

        listeners.add(Arc::new(Log::default()), erased_a);
        listeners.add(Arc::new(Log::default()), erased_b);

        listeners.queue(push(1));

        assert_eq!(listeners.call_pool().in_use(), 1);

        queue_a.synchronize();
        assert_eq!(listeners.call_pool().in_use(), 1);

        queue_b.synchronize();
        assert_eq!(listeners.call_pool().in_use(), 0);
    }

    #[test]
    fn late_listener_misses_earlier_queued_call() {
        let listeners = Listeners::<Log>::new();
        let (queue, erased) = manual_queue();

        let early = Arc::new(Log::default());
        let late = Arc::new(Log::default());

        listeners.add(Arc::clone(&early), Arc::clone(&erased));
        listeners.queue(push(1));
        listeners.add(Arc::clone(&late), erased);
        listeners.queue(push(2));

        queue.synchronize();

        assert_eq!(early.take(), vec![1, 2]);
        assert_eq!(late.take(), vec![2]);
    }

    #[test]
    fn removed_listener_skips_queued_calls() {
        let listeners = Listeners::<Log>::new();
        let (queue, erased) = manual_queue();

        let kept = Arc::new(Log::default());
        let removed = Arc::new(Log::default());

        listeners.add(Arc::clone(&kept), Arc::clone(&erased));
        listeners.add(Arc::clone(&removed), erased);

        listeners.queue(push(1));
        listeners.remove(&removed);

        queue.synchronize();

        assert_eq!(kept.take(), vec![1]);
        assert!(removed.take().is_empty());
    }

    #[test]
    fn readded_listener_does_not_receive_calls_from_before() {
        let listeners = Listeners::<Log>::new();
        let (queue, erased) = manual_queue();
        let log = Arc::new(Log::default());

        listeners.add(Arc::clone(&log), Arc::clone(&erased));
        listeners.queue(push(1));
        listeners.remove(&log);
        listeners.add(Arc::clone(&log), erased);
        listeners.queue(push(2));

        queue.synchronize();
        assert_eq!(log.take(), vec![2]);
    }

    #[test]
    fn dispatch1_targets_only_one_listener() {
        let listeners = Listeners::<Log>::new();
        let (queue, erased) = manual_queue();

        let target = Arc::new(Log::default());
        let other = Arc::new(Log::default());

        listeners.add(Arc::clone(&target), Arc::clone(&erased));
        listeners.add(Arc::clone(&other), erased);

        listeners.queue1(&target, push(1));
        queue.synchronize();

        listeners.call1(&target, push(2));

        assert_eq!(target.take(), vec![1, 2]);
        assert!(other.take().is_empty());
    }

    #[test]
    fn dispatch1_to_unregistered_is_noop() {
        let listeners = Listeners::<Log>::new();
        let stranger = Arc::new(Log::default());

        listeners.call1(&stranger, push(1));

        assert!(stranger.take().is_empty());
        assert_eq!(listeners.call_pool().in_use(), 0);
    }

    #[test]
    fn update_consolidates_pending_calls() {
        let listeners = Listeners::<Log>::new();
        let (queue, erased) = manual_queue();
        let log = Arc::new(Log::default());
        let kind = NotificationKind::named("progress");

        listeners.add(Arc::clone(&log), erased);

        let first = listeners.new_call(push(1));
        let second = listeners.new_call(push(2));

        listeners.update(kind, &first, DispatchMode::Queue);
        listeners.update(kind, &second, DispatchMode::Queue);
        drop(first);
        drop(second);

        assert_eq!(queue.pending(), 1);
        queue.synchronize();
        assert_eq!(log.take(), vec![2]);

        listeners.update(kind, &listeners.new_call(push(3)), DispatchMode::Queue);
        queue.synchronize();
        assert_eq!(log.take(), vec![3]);

        assert_eq!(listeners.call_pool().in_use(), 0);
    }

    #[test]
    fn different_kinds_do_not_consolidate() {
        let listeners = Listeners::<Log>::new();
        let (queue, erased) = manual_queue();
        let log = Arc::new(Log::default());

        listeners.add(Arc::clone(&log), erased);

        let progress = NotificationKind::named("progress");
        let status = NotificationKind::named("status");

        listeners.update(progress, &listeners.new_call(push(1)), DispatchMode::Queue);
        listeners.update(status, &listeners.new_call(push(2)), DispatchMode::Queue);
        listeners.update(progress, &listeners.new_call(push(3)), DispatchMode::Queue);

        queue.synchronize();
        assert_eq!(log.take(), vec![3, 2]);
    }

    #[test]
    fn update_with_runs_inline_on_owning_thread() {
        let listeners = Listeners::<Log>::new();
        let (_queue, erased) = manual_queue();
        let log = Arc::new(Log::default());

        listeners.add(Arc::clone(&log), erased);

        listeners.update_with(NotificationKind::named("progress"), push(1));
        listeners.update_with(NotificationKind::named("progress"), push(2));

        assert_eq!(log.take(), vec![1, 2]);
    }

    #[test]
    fn update_with_on_owning_thread_delivers_consolidated_update() {
        let listeners = Listeners::<Log>::new();
        let (queue, erased) = manual_queue();
        let log = Arc::new(Log::default());
        let kind = NotificationKind::named("progress");

        listeners.add(Arc::clone(&log), erased);

        listeners.update(kind, &listeners.new_call(push(1)), DispatchMode::Queue);
        assert_eq!(queue.pending(), 1);

        // Replaces the pending update, which must then run before returning.
        listeners.update_with(kind, push(2));

        assert_eq!(log.take(), vec![2]);
        assert_eq!(queue.pending(), 0);
        assert_eq!(listeners.call_pool().in_use(), 0);
    }

    #[cfg_attr(miri, ignore)] // Spawns threads, too slow under Miri.
    #[test]
    fn superseded_update_is_released_outside_registry_locks() {
        struct AddsOnDrop {
            value: u32,
            listeners: Weak<Listeners<Log>>,
            queue: Arc<dyn CallQueue>,
        }

        impl AddsOnDrop {
            fn record(&self, log: &Log) {
                log.0.lock().push(self.value);
            }
        }

        impl Drop for AddsOnDrop {
            fn drop(&mut self) {
                if let Some(listeners) = self.listeners.upgrade() {
                    listeners.add(Arc::new(Log::default()), Arc::clone(&self.queue));
                }
            }
        }

        with_watchdog(|| {
            let listeners = Arc::new(Listeners::<Log>::new());
            let (queue, erased) = manual_queue();
            let log = Arc::new(Log::default());
            let kind = NotificationKind::named("progress");

            listeners.add(Arc::clone(&log), Arc::clone(&erased));

            let on_drop = AddsOnDrop {
                value: 1,
                listeners: Arc::downgrade(&listeners),
                queue: erased,
            };

            let first = listeners.new_call(move |log: &Log| on_drop.record(log));
            listeners.update(kind, &first, DispatchMode::Queue);
            drop(first);

            // The pending slot holds the last reference to the first call.
            listeners.update(kind, &listeners.new_call(push(2)), DispatchMode::Queue);

            assert_eq!(listeners.len(), 2);

            queue.synchronize();
            assert_eq!(log.take(), vec![2]);
        });
    }

    #[test]
    fn pruning_group_forgets_proxy_slots() {
        let listeners = Listeners::<Log>::new();
        let (queue, erased) = manual_queue();
        let log = Arc::new(Log::default());
        let kind = NotificationKind::named("progress");

        listeners.add(Arc::clone(&log), Arc::clone(&erased));
        listeners.update(kind, &listeners.new_call(push(1)), DispatchMode::Queue);
        listeners.remove(&log);

        assert_eq!(listeners.proxy(kind).slot_count(), 0);

        // The queued update runs against an empty group.
        queue.synchronize();
        assert!(log.take().is_empty());

        // A new group on the same queue starts with a clean slate.
        listeners.add(Arc::clone(&log), erased);
        listeners.update(kind, &listeners.new_call(push(2)), DispatchMode::Queue);
        queue.synchronize();
        assert_eq!(log.take(), vec![2]);
    }

    #[test]
    fn listener_can_remove_itself_during_inline_call() {
        struct SelfRemoving {
            registry: Arc<Listeners<SelfRemoving>>,
            me: Mutex<Option<Arc<SelfRemoving>>>,
            hits: AtomicU32,
        }

        let registry = Arc::new(Listeners::<SelfRemoving>::new());
        let (_queue, erased) = manual_queue();

        let listener = Arc::new(SelfRemoving {
            registry: Arc::clone(&registry),
            me: Mutex::new(None),
            hits: AtomicU32::new(0),
        });
        *listener.me.lock() = Some(Arc::clone(&listener));

        registry.add(Arc::clone(&listener), erased);

        let notify = |listener: &SelfRemoving| {
            listener.hits.fetch_add(1, Ordering::Relaxed);

            if let Some(me) = listener.me.lock().take() {
                listener.registry.remove(&me);
            }
        };

        registry.call(notify);
        registry.call(notify);

        assert_eq!(listener.hits.load(Ordering::Relaxed), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn builder_sets_pool_capacity() {
        let listeners = Listeners::<Log>::builder().call_pool_capacity(3).build();
        let (_queue, erased) = manual_queue();

        listeners.add(Arc::new(Log::default()), erased);
        listeners.queue(push(1));

        assert_eq!(listeners.call_pool().capacity(), 3);
    }

    #[test]
    #[should_panic]
    fn builder_rejects_zero_capacity() {
        drop(Listeners::<Log>::builder().call_pool_capacity(0));
    }
}
