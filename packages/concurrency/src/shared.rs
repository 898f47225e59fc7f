use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;

use crate::{Reclaimer, RefCount};

/// An object whose lifetime is governed by [`Shared`] handles.
///
/// When the last handle is dropped, [`destroy()`][1] decides what happens to the object. The
/// default hands it to the [global reclaimer][2], so the thread releasing the last reference
/// never runs a potentially deep chain of destructors. Types that are cheap to drop, or that
/// must be dropped on the releasing thread, override it to drop synchronously.
///
/// # Example
///
/// ```rust
/// use concurrency::{Shared, SharedObject};
///
/// struct Frame(Vec<f32>);
///
/// // Teardown happens on the reclaimer thread.
/// impl SharedObject for Frame {}
///
/// struct Counter(u64);
///
/// impl SharedObject for Counter {
///     fn destroy(self) {
///         drop(self);
///     }
/// }
///
/// let frame = Shared::new(Frame(vec![0.0; 512]));
/// let other = frame.clone();
/// drop(frame);
/// assert_eq!(other.0.len(), 512);
///
/// let counter = Shared::new(Counter(5));
/// assert_eq!(counter.0, 5);
/// ```
///
/// [1]: Self::destroy
/// [2]: Reclaimer::global
pub trait SharedObject: Send + Sized + 'static {
    /// Called exactly once, with the object by value, after the last handle is released.
    fn destroy(self) {
        Reclaimer::global().reclaim(self);
    }
}

/// A thread-safe reference-counted handle to a [`SharedObject`].
///
/// Cloning the handle acquires a reference and dropping it releases one. Acquire and release
/// are lock-free. Releasing the last reference calls [`SharedObject::destroy()`] exactly once.
pub struct Shared<T: SharedObject> {
    ptr: NonNull<SharedBox<T>>,

    _owns: PhantomData<SharedBox<T>>,
}

struct SharedBox<T> {
    ref_count: RefCount,
    value: T,
}

impl<T: SharedObject> Shared<T> {
    /// Moves `value` into shared ownership, returning the first handle.
    #[must_use]
    pub fn new(value: T) -> Self {
        let boxed = Box::new(SharedBox {
            ref_count: RefCount::new(),
            value,
        });

        Self {
            ptr: NonNull::from(Box::leak(boxed)),
            _owns: PhantomData,
        }
    }

    /// Number of handles currently referencing the object. Diagnostic only.
    #[must_use]
    pub fn ref_count(this: &Self) -> usize {
        this.shared_box().ref_count.get()
    }

    /// Whether both handles reference the same object.
    #[must_use]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.ptr == other.ptr
    }

    fn shared_box(&self) -> &SharedBox<T> {
        // SAFETY: The box stays allocated while any handle exists, and we are a handle.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: SharedObject> Clone for Shared<T> {
    fn clone(&self) -> Self {
        self.shared_box().ref_count.acquire();

        Self {
            ptr: self.ptr,
            _owns: PhantomData,
        }
    }
}

impl<T: SharedObject> Drop for Shared<T> {
    fn drop(&mut self) {
        if !self.shared_box().ref_count.release() {
            return;
        }

        // SAFETY: We released the last reference, so no other handle can observe the box any
        // more and we are the only one to reconstitute it. It came from Box::leak in new().
        let shared_box = unsafe { Box::from_raw(self.ptr.as_ptr()) };

        let SharedBox { value, .. } = *shared_box;
        value.destroy();
    }
}

impl<T: SharedObject> Deref for Shared<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.shared_box().value
    }
}

impl<T: SharedObject + fmt::Debug> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("ref_count", &Self::ref_count(self))
            .field("value", &**self)
            .finish()
    }
}

// SAFETY: Handles on different threads share `&T` (needs Sync) and whichever releases last
// moves the `T` out on its own thread (needs Send, already required by SharedObject).
unsafe impl<T: SharedObject + Sync> Send for Shared<T> {}

// SAFETY: Same reasoning as Send - a `&Shared<T>` only grants `&T` or a clone.
unsafe impl<T: SharedObject + Sync> Sync for Shared<T> {}
