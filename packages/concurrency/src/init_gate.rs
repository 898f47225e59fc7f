use std::sync::atomic::{AtomicU8, Ordering};

use crossbeam::utils::Backoff;

// Uninitialized -> Initializing -> Initialized, never back.
const UNINITIALIZED: u8 = 0;
const INITIALIZING: u8 = 1;
const INITIALIZED: u8 = 2;

/// A lock-free gate that lets exactly one caller run an initialization routine.
///
/// The first caller of [`begin()`][1] wins and must call [`end()`][2] once the initialized
/// resource is ready. Every other caller of `begin()` gets `false`, and if it arrives while the
/// winner is still working it spins (with backoff) until `end()` has been observed, so no caller
/// ever proceeds with a half-initialized resource.
///
/// The gate is consumed once: after `end()` it stays initialized for its entire lifetime.
///
/// # Example
///
/// ```rust
/// use concurrency::InitGate;
///
/// static GATE: InitGate = InitGate::new();
///
/// if GATE.begin() {
///     // Initialize the process-wide resource here.
///     GATE.end();
/// }
///
/// assert!(GATE.is_initialized());
/// assert!(!GATE.begin());
/// ```
///
/// [1]: Self::begin
/// [2]: Self::end
#[derive(Debug)]
pub struct InitGate {
    state: AtomicU8,
}

impl InitGate {
    /// Creates an uninitialized gate. Usable in `static` items.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINITIALIZED),
        }
    }

    /// Returns `true` to exactly one caller, who must then initialize and call [`end()`][1].
    ///
    /// Returns `false` to everyone else, but only after initialization has completed.
    ///
    /// [1]: Self::end
    #[must_use]
    pub fn begin(&self) -> bool {
        // Fast path for the overwhelmingly common case of a long-initialized gate.
        if self.state.load(Ordering::Acquire) == INITIALIZED {
            return false;
        }

        if self
            .state
            .compare_exchange(
                UNINITIALIZED,
                INITIALIZING,
                Ordering::Acquire,
                Ordering::Acquire,
            )
            .is_ok()
        {
            return true;
        }

        let backoff = Backoff::new();

        // Acquire pairs with the Release in end(), publishing everything the winner wrote.
        while self.state.load(Ordering::Acquire) != INITIALIZED {
            backoff.snooze();
        }

        false
    }

    /// Marks initialization as complete, releasing everyone spinning in [`begin()`][1].
    ///
    /// # Panics
    ///
    /// Panics if the gate is not currently being initialized, i.e. the caller did not win
    /// `begin()` or has already called `end()`.
    ///
    /// [1]: Self::begin
    pub fn end(&self) {
        // Only the begin() winner moves the state. A misplaced end() leaves it untouched.
        if let Err(actual) = self.state.compare_exchange(
            INITIALIZING,
            INITIALIZED,
            Ordering::Release,
            Ordering::Relaxed,
        ) {
            panic!(
                "InitGate::end() called in state {actual} by a caller that did not win InitGate::begin()"
            );
        }
    }

    /// Whether initialization has completed.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state.load(Ordering::Acquire) == INITIALIZED
    }
}

impl Default for InitGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::thread;
    use std::time::Duration;

    use static_assertions::assert_impl_all;
    use testing::{run_contenders, with_watchdog};

    use super::*;

    assert_impl_all!(InitGate: Send, Sync);

    #[test]
    fn first_begin_wins() {
        let gate = InitGate::new();

        assert!(!gate.is_initialized());
        assert!(gate.begin());

        gate.end();

        assert!(gate.is_initialized());
        assert!(!gate.begin());
        assert!(!gate.begin());
    }

    #[test]
    #[should_panic]
    fn end_without_begin_panics() {
        let gate = InitGate::new();
        gate.end();
    }

    #[test]
    fn misplaced_end_leaves_gate_uninitialized() {
        let gate = InitGate::new();

        panic::catch_unwind(AssertUnwindSafe(|| gate.end())).unwrap_err();

        assert!(!gate.is_initialized());
        assert!(gate.begin());
        gate.end();
        assert!(gate.is_initialized());
    }

    #[test]
    #[should_panic]
    fn end_twice_panics() {
        let gate = InitGate::new();
        assert!(gate.begin());
        gate.end();
        gate.end();
    }

    #[cfg_attr(miri, ignore)] // Spawns many threads, too slow under Miri.
    #[test]
    fn exactly_one_winner_and_losers_wait_for_end() {
        with_watchdog(|| {
            const CONTENDERS: usize = 16;

            let gate = Arc::new(InitGate::new());
            let resource_ready = Arc::new(AtomicBool::new(false));
            let winners = Arc::new(AtomicUsize::new(0));

            run_contenders(CONTENDERS, {
                let gate = Arc::clone(&gate);
                let resource_ready = Arc::clone(&resource_ready);
                let winners = Arc::clone(&winners);

                move |_| {
                    if gate.begin() {
                        winners.fetch_add(1, Ordering::Relaxed);

                        // Give the losers time to pile up behind us.
                        thread::sleep(Duration::from_millis(20));
                        resource_ready.store(true, Ordering::Relaxed);

                        gate.end();
                    } else {
                        // The Release in end() makes this visible to every loser.
                        assert!(resource_ready.load(Ordering::Relaxed));
                    }
                }
            });

            assert_eq!(winners.load(Ordering::Relaxed), 1);
            assert!(gate.is_initialized());
        });
    }
}
