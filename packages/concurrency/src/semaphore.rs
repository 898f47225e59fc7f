use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use event_listener::{Event, Listener};
use parking_lot::Mutex;

/// A counting semaphore with an explicit first-come-first-served list of waiting threads.
///
/// [`signal(n)`][1] makes `n` units available and hands them directly to up to `n` waiting
/// threads in the order they started waiting. Each waiter has its own wake event and is woken
/// exactly once. Units nobody is waiting for are kept for future [`wait()`][2] calls.
///
/// A timed-out waiter leaves the list without consuming anything. If a signal arrives exactly as
/// the waiter times out, the waiter reports success and keeps the unit, so no signal is ever
/// lost.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
///
/// use concurrency::Semaphore;
///
/// let semaphore = Semaphore::new(1);
///
/// assert!(semaphore.try_wait());
/// assert!(!semaphore.wait_timeout(Duration::from_millis(1)));
///
/// semaphore.signal(1);
/// semaphore.wait();
/// ```
///
/// [1]: Self::signal
/// [2]: Self::wait
pub struct Semaphore {
    state: Mutex<State>,
}

struct State {
    available: usize,
    waiters: VecDeque<Arc<Waiter>>,
}

struct Waiter {
    /// Set (under the semaphore lock) when a unit has been handed to this waiter.
    signaled: AtomicBool,
    wake: Event,
}

impl Waiter {
    fn new() -> Self {
        Self {
            signaled: AtomicBool::new(false),
            wake: Event::new(),
        }
    }

    fn is_signaled(&self) -> bool {
        // Pairs with the Release in hand_to().
        self.signaled.load(Ordering::Acquire)
    }

    fn hand_to(&self) {
        self.signaled.store(true, Ordering::Release);
        self.wake.notify(1);
    }
}

impl Semaphore {
    /// Creates a semaphore with `initial` units available.
    #[must_use]
    pub fn new(initial: usize) -> Self {
        Self {
            state: Mutex::new(State {
                available: initial,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Makes `amount` units available, waking up to `amount` waiting threads in arrival order.
    ///
    /// # Panics
    ///
    /// Panics if the number of available units would overflow.
    pub fn signal(&self, amount: usize) {
        let mut state = self.state.lock();
        let mut remaining = amount;

        while remaining > 0 {
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };

            waiter.hand_to();
            remaining = remaining.wrapping_sub(1);
        }

        state.available = state
            .available
            .checked_add(remaining)
            .expect("semaphore count overflow");
    }

    /// Blocks until a unit is acquired.
    pub fn wait(&self) {
        let acquired = self.wait_until(None);
        debug_assert!(acquired, "an unbounded wait can only end by acquiring a unit");
    }

    /// Blocks until a unit is acquired or `timeout` elapses. Returns whether a unit was acquired.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        // A timeout too large to represent is as good as no timeout.
        self.wait_until(Instant::now().checked_add(timeout))
    }

    /// Acquires a unit if one is available right now, without blocking.
    #[must_use]
    pub fn try_wait(&self) -> bool {
        let mut state = self.state.lock();

        if state.available > 0 {
            state.available = state.available.wrapping_sub(1);
            true
        } else {
            false
        }
    }

    /// Units available for immediate acquisition.
    #[must_use]
    pub fn available(&self) -> usize {
        self.state.lock().available
    }

    /// Threads currently blocked in a wait.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    fn wait_until(&self, deadline: Option<Instant>) -> bool {
        let waiter = {
            let mut state = self.state.lock();

            if state.available > 0 {
                state.available = state.available.wrapping_sub(1);
                return true;
            }

            if deadline.is_some_and(|deadline| deadline <= Instant::now()) {
                return false;
            }

            let waiter = Arc::new(Waiter::new());
            state.waiters.push_back(Arc::clone(&waiter));
            waiter
        };

        loop {
            let listener = waiter.wake.listen();

            // Check after listening, so a hand-off between the two cannot be missed.
            if waiter.is_signaled() {
                return true;
            }

            match deadline {
                None => listener.wait(),
                Some(deadline) => {
                    if listener.wait_deadline(deadline).is_none() {
                        break;
                    }
                }
            }
        }

        let mut state = self.state.lock();

        // The unit may have been handed to us while we were timing out. It is ours now, and
        // reporting failure here would lose it.
        if waiter.is_signaled() {
            return true;
        }

        state
            .waiters
            .retain(|candidate| !Arc::ptr_eq(candidate, &waiter));

        false
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();

        f.debug_struct("Semaphore")
            .field("available", &state.available)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}
