use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use concurrency::RefCount;
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use tracing::debug;

/// The notification carried by a [`Call`], applied to each recipient listener in turn.
pub type Notify<L> = Box<dyn Fn(&L) + Send + Sync + 'static>;

/// Segment `k` holds `first_segment_len << k` slots. With at least one slot in the first
/// segment, this allows for more slots than any process will ever have memory for.
const MAX_SEGMENTS: usize = 32;

/// Number of slots in the first segment of a pool created by `Listeners::new()`.
pub(crate) const DEFAULT_CALL_POOL_CAPACITY: usize = 64;

/// A unit of deferred notification work, allocated from a [`CallPool`].
///
/// A `Call` is a shared handle: cloning it adds a reference to the same pooled notification and
/// dropping the last handle returns the slot to the pool. The registry clones one `Call` into
/// every call queue it dispatches to, so the notification is allocated once no matter how many
/// queues receive it.
pub struct Call<L: ?Sized> {
    pool: Arc<CallPool<L>>,
    index: usize,
}

impl<L: ?Sized> Call<L> {
    /// Applies the notification to `listener`.
    pub fn invoke(&self, listener: &L) {
        let slot = self.pool.slot(self.index);

        // SAFETY: We hold a reference to the slot, so the payload was written before this handle
        // was created and will not be cleared until the last handle is dropped. Shared access
        // is all anyone does while references exist.
        let notify = unsafe { &*slot.notify.get() };

        if let Some(notify) = notify {
            notify(listener);
        }
    }

    /// Whether two handles refer to the same pooled notification.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.pool, &other.pool) && self.index == other.index
    }
}

impl<L: ?Sized> Clone for Call<L> {
    fn clone(&self) -> Self {
        self.pool.slot(self.index).ref_count.acquire();

        Self {
            pool: Arc::clone(&self.pool),
            index: self.index,
        }
    }
}

impl<L: ?Sized> Drop for Call<L> {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

impl<L: ?Sized> fmt::Debug for Call<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("index", &self.index)
            .field("references", &self.pool.slot(self.index).ref_count.get())
            .finish()
    }
}

struct Slot<L: ?Sized> {
    ref_count: RefCount,
    notify: UnsafeCell<Option<Notify<L>>>,
}

impl<L: ?Sized> Slot<L> {
    fn vacant() -> Self {
        Self {
            ref_count: RefCount::released(),
            notify: UnsafeCell::new(None),
        }
    }
}

/// A recycling arena of [`Call`] slots.
///
/// Slots are addressed by index. Vacant indexes sit on a lock-free free list, so creating and
/// dropping calls never blocks. When the free list runs dry the pool grows by a new segment
/// twice the size of the previous one; growing is the only operation that takes a lock.
///
/// Existing slots never move, and the pool never gives up on a notification: if it cannot grow
/// any further, it panics.
///
/// # Example
///
/// ```rust
/// use listeners::CallPool;
///
/// let pool = CallPool::<str>::new(4);
/// let call = pool.call(|text: &str| println!("{text}"));
///
/// assert_eq!(pool.in_use(), 1);
/// call.invoke("hello");
///
/// drop(call);
/// assert_eq!(pool.in_use(), 0);
/// ```
pub struct CallPool<L: ?Sized> {
    segments: Box<[OnceLock<Box<[Slot<L>]>>]>,
    first_segment_len: usize,

    free: SegQueue<usize>,

    grow_lock: Mutex<()>,

    capacity: AtomicUsize,
    in_use: AtomicUsize,
}

impl<L: ?Sized> CallPool<L> {
    /// Creates a pool whose first segment holds `capacity` calls.
    ///
    /// No memory is allocated for slots until the first call is created.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        assert!(capacity > 0, "call pool capacity must be at least 1");

        Arc::new(Self {
            segments: (0..MAX_SEGMENTS).map(|_| OnceLock::new()).collect(),
            first_segment_len: capacity,
            free: SegQueue::new(),
            grow_lock: Mutex::new(()),
            capacity: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
        })
    }

    /// Stores `notify` in a vacant slot and returns the first handle to it.
    ///
    /// # Panics
    ///
    /// Panics if the pool is full and cannot grow any further.
    pub fn call(self: &Arc<Self>, notify: impl Fn(&L) + Send + Sync + 'static) -> Call<L> {
        let index = self.free.pop().unwrap_or_else(|| self.grow());
        let slot = self.slot(index);

        // SAFETY: The index came off the free list, so no handle to this slot exists and we are
        // the only party that can touch its payload until we hand out the first handle below.
        unsafe {
            *slot.notify.get() = Some(Box::new(notify));
        }

        slot.ref_count.revive();
        self.in_use.fetch_add(1, Ordering::Relaxed);

        Call {
            pool: Arc::clone(self),
            index,
        }
    }

    /// Number of calls currently holding a slot.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Number of slots allocated so far, vacant or not.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    fn release(&self, index: usize) {
        let slot = self.slot(index);

        if !slot.ref_count.release() {
            return;
        }

        // SAFETY: That was the last reference, so nobody else can be reading the payload and
        // the index is not yet on the free list.
        let notify = unsafe { (*slot.notify.get()).take() };

        self.in_use.fetch_sub(1, Ordering::Relaxed);
        self.free.push(index);

        // Dropping the closure may run arbitrary code, so do it after the slot is consistent.
        drop(notify);
    }

    #[expect(
        clippy::indexing_slicing,
        reason = "locate() only produces in-bounds segment numbers and offsets"
    )]
    fn slot(&self, index: usize) -> &Slot<L> {
        let (segment, offset) = self.locate(index);

        let segment = self.segments[segment]
            .get()
            .expect("call index refers to a segment that was never allocated");

        &segment[offset]
    }

    /// Maps a pool-wide index to a segment number and an offset in that segment.
    #[expect(
        clippy::arithmetic_side_effects,
        clippy::integer_division,
        reason = "segment bounds are far below usize::MAX and we want the floor"
    )]
    fn locate(&self, index: usize) -> (usize, usize) {
        // Segment k starts at first_segment_len * (2^k - 1).
        let scaled = index / self.first_segment_len + 1;
        let segment = (usize::BITS - 1 - scaled.leading_zeros()) as usize;
        let segment_start = self.first_segment_len * ((1_usize << segment) - 1);

        (segment, index - segment_start)
    }

    /// Allocates the next segment, puts all but one of its slots on the free list and returns
    /// the remaining one.
    #[cold]
    #[expect(
        clippy::arithmetic_side_effects,
        clippy::indexing_slicing,
        reason = "segment count is checked against MAX_SEGMENTS and sizes with checked_mul"
    )]
    fn grow(&self) -> usize {
        let _growing = self.grow_lock.lock();

        // Someone may have grown the pool or released a call while we waited for the lock.
        if let Some(index) = self.free.pop() {
            return index;
        }

        // The next segment starts right after the current capacity.
        let start = self.capacity.load(Ordering::Relaxed);
        let (segment, _) = self.locate(start);

        assert!(
            segment < MAX_SEGMENTS,
            "call pool exhausted after {MAX_SEGMENTS} segments - notifications are leaking"
        );

        let len = 1_usize
            .checked_shl(u32::try_from(segment).expect("segment count fits in u32"))
            .and_then(|factor| factor.checked_mul(self.first_segment_len))
            .expect("call pool segment size overflows usize");

        let slots = (0..len).map(|_| Slot::vacant()).collect::<Box<[_]>>();

        assert!(
            self.segments[segment].set(slots).is_ok(),
            "call pool segment {segment} allocated twice"
        );

        self.capacity.store(start + len, Ordering::Relaxed);

        for index in (start + 1)..(start + len) {
            self.free.push(index);
        }

        debug!(
            segment,
            slots = len,
            capacity = start + len,
            "call pool grew"
        );

        start
    }
}

impl<L: ?Sized> fmt::Debug for CallPool<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallPool")
            .field("capacity", &self.capacity())
            .field("in_use", &self.in_use())
            .finish_non_exhaustive()
    }
}

// SAFETY: The payloads are Send + Sync closures. A slot's payload is only written by the single
// party that owns the slot exclusively: the allocator that popped its index off the free list,
// or the holder of the last reference. While references exist, access is shared and read-only.
unsafe impl<L: ?Sized> Send for CallPool<L> {}

// SAFETY: See the Send impl above.
unsafe impl<L: ?Sized> Sync for CallPool<L> {}
