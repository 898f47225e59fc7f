#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for threaded tests and examples in this workspace.

use std::sync::{Arc, Barrier, mpsc};
use std::thread;
use std::time::Duration;

/// Runs a test body on a separate thread and fails the test if it does not finish in time.
///
/// Concurrency bugs in this workspace tend to show up as deadlocks or lost wakeups, which would
/// otherwise hang the test run. The timeout is 10 seconds, or 60 seconds under Miri.
///
/// When the `MUTATION_TESTING` environment variable is set to "1", the body runs directly on the
/// calling thread so that mutation testing can observe the hang itself.
///
/// # Panics
///
/// Panics if the body times out, and resumes the body's panic if it panicked.
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// let answer = with_watchdog(|| 6 * 7);
/// assert_eq!(answer, 42);
/// ```
pub fn with_watchdog<F, R>(body: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if std::env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return body();
    }

    let timeout = if cfg!(miri) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(10)
    };

    let (tx, rx) = mpsc::channel();

    let body_thread = thread::spawn(move || {
        // If the receiver is gone, the watchdog already gave up on us.
        drop(tx.send(body()));
    });

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            body_thread.join().expect("body finished, so its thread cannot panic");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("test exceeded the {timeout:?} watchdog timeout - likely a deadlock")
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match body_thread.join() {
            Ok(()) => panic!("test body thread disconnected without a result"),
            Err(payload) => std::panic::resume_unwind(payload),
        },
    }
}

/// Runs `contender` on `count` threads that all start at the same moment, then joins them.
///
/// Each thread receives its index in `0..count`. Starting everyone behind a barrier maximizes
/// the overlap between threads, which is what contention tests want.
///
/// # Panics
///
/// Resumes the first panic raised by any contender, after all of them have finished.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// use testing::run_contenders;
///
/// let total = Arc::new(AtomicUsize::new(0));
///
/// run_contenders(4, {
///     let total = Arc::clone(&total);
///     move |index| {
///         total.fetch_add(index, Ordering::Relaxed);
///     }
/// });
///
/// assert_eq!(total.load(Ordering::Relaxed), 0 + 1 + 2 + 3);
/// ```
pub fn run_contenders<F>(count: usize, contender: F)
where
    F: Fn(usize) + Send + Sync + 'static,
{
    let contender = Arc::new(contender);
    let start = Arc::new(Barrier::new(count));

    let handles = (0..count)
        .map(|index| {
            let contender = Arc::clone(&contender);
            let start = Arc::clone(&start);

            thread::spawn(move || {
                start.wait();
                contender(index);
            })
        })
        .collect::<Vec<_>>();

    // Drop our copy now so the contender is gone once the threads are.
    drop(contender);

    let mut first_panic = None;

    for handle in handles {
        if let Err(payload) = handle.join() {
            first_panic.get_or_insert(payload);
        }
    }

    if let Some(payload) = first_panic {
        std::panic::resume_unwind(payload);
    }
}
