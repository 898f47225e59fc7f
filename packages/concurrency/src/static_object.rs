use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::process;

use crate::InitGate;

/// A value with process-wide lifetime that is created on first access.
///
/// Initialization goes through an [`InitGate`], so the initializer runs exactly once even when
/// many threads race for the first access, and no thread sees the value before it is complete.
///
/// If the initializer panics, the process is aborted: the gate has no way back to the
/// uninitialized state, so every later access would otherwise wait forever.
///
/// # Example
///
/// ```rust
/// use concurrency::StaticObject;
///
/// static GREETING: StaticObject<String> = StaticObject::new(|| "hello".to_string());
///
/// assert_eq!(GREETING.get(), "hello");
/// ```
pub struct StaticObject<T> {
    gate: InitGate,
    value: UnsafeCell<MaybeUninit<T>>,
    init: fn() -> T,
}

// SAFETY: The value is written exactly once, by the gate winner, before the gate publishes it.
// After that only shared references are handed out, so sharing requires `T: Sync`, and because
// whichever thread drops us drops the value, it also requires `T: Send`.
unsafe impl<T: Send + Sync> Sync for StaticObject<T> {}

impl<T> StaticObject<T> {
    /// Creates an empty slot that will be filled by `init` on first access.
    #[must_use]
    pub const fn new(init: fn() -> T) -> Self {
        Self {
            gate: InitGate::new(),
            value: UnsafeCell::new(MaybeUninit::uninit()),
            init,
        }
    }

    /// Returns the value, creating it first if this is the first access.
    pub fn get(&self) -> &T {
        if self.gate.begin() {
            let abort_on_unwind = scopeguard::guard((), |()| process::abort());

            let value = (self.init)();

            // SAFETY: We won the gate, so nobody else touches the storage until end().
            unsafe {
                (*self.value.get()).write(value);
            }

            scopeguard::ScopeGuard::into_inner(abort_on_unwind);
            self.gate.end();
        }

        // SAFETY: begin() only returns false once the gate is initialized, and the winner
        // reaches this line after calling end(), so the value is always written by now.
        unsafe { (*self.value.get()).assume_init_ref() }
    }

    /// Returns the value if it has already been created.
    #[must_use]
    pub fn get_if_initialized(&self) -> Option<&T> {
        if self.gate.is_initialized() {
            // SAFETY: The gate is initialized, so the value has been written and published.
            Some(unsafe { (*self.value.get()).assume_init_ref() })
        } else {
            None
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for StaticObject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticObject")
            .field("value", &self.get_if_initialized())
            .finish_non_exhaustive()
    }
}

impl<T> Drop for StaticObject<T> {
    fn drop(&mut self) {
        if self.gate.is_initialized() {
            // SAFETY: Initialized means written, and we have exclusive access in drop().
            unsafe {
                self.value.get_mut().assume_init_drop();
            }
        }
    }
}
