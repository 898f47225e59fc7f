use std::sync::atomic::{self, AtomicUsize};

/// A thread-safe reference count that starts out owned by its creator.
///
/// This is the lock-free core of every shared object in this crate. It knows nothing about
/// what it is counting references to - the owner decides what happens when [`release()`][1]
/// reports that the last reference is gone.
///
/// Over-release is a programming error that would otherwise lead to use-after-free, so it
/// panics instead of being tolerated.
///
/// [1]: Self::release
#[derive(Debug)]
pub struct RefCount {
    count: AtomicUsize,
}

impl RefCount {
    /// Creates a reference count holding one reference, owned by the caller.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            count: AtomicUsize::new(1),
        }
    }

    /// Creates a reference count with no references, for storage that is brought to life later
    /// via [`revive()`][Self::revive].
    #[must_use]
    pub const fn released() -> Self {
        Self {
            count: AtomicUsize::new(0),
        }
    }

    /// Adds a reference.
    ///
    /// # Panics
    ///
    /// Panics if the count was zero (resurrection of a released object) or would overflow.
    pub fn acquire(&self) {
        // Relaxed is enough: a new reference can only be created from an existing one, which
        // already keeps the object alive.
        let previous = self.count.fetch_add(1, atomic::Ordering::Relaxed);

        assert_ne!(
            previous, 0,
            "acquired a reference to an object that was already released"
        );
        assert_ne!(previous, usize::MAX, "reference count overflow");
    }

    /// Drops a reference and returns `true` if it was the last one.
    ///
    /// Exactly one caller ever observes `true` for a given lifetime of the count.
    ///
    /// # Panics
    ///
    /// Panics if the count was already zero.
    #[must_use]
    pub fn release(&self) -> bool {
        match self.count.fetch_sub(1, atomic::Ordering::Release) {
            1 => {
                // Pairs with the Release above on every other thread, so the caller who tears
                // the object down observes all writes made while it was shared.
                atomic::fence(atomic::Ordering::Acquire);
                true
            }
            0 => panic!(
                "reference count underflow - an object was released more times than it was acquired"
            ),
            _ => false,
        }
    }

    /// Transitions a released count back to a single owned reference.
    ///
    /// Used by pools that recycle storage. The caller must have exclusive access to the storage.
    ///
    /// # Panics
    ///
    /// Panics if the count is not zero.
    pub fn revive(&self) {
        let revived = self
            .count
            .compare_exchange(0, 1, atomic::Ordering::Acquire, atomic::Ordering::Relaxed);

        assert!(
            revived.is_ok(),
            "revived a reference count that still had live references"
        );
    }

    /// Whether any reference is outstanding. The answer may be stale unless the caller
    /// synchronizes with every holder.
    #[must_use]
    pub fn is_referenced(&self) -> bool {
        self.count.load(atomic::Ordering::Acquire) != 0
    }

    /// Current number of references. Diagnostic only.
    #[must_use]
    pub fn get(&self) -> usize {
        self.count.load(atomic::Ordering::Relaxed)
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}
