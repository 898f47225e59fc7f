//! Example from the README.
//!
//! A producer thread publishes download progress to a listener that lives on its own worker
//! thread. Progress updates are consolidated, so the listener may skip intermediate values but
//! always sees the final one.
//!
//! Run with `RUST_LOG=listeners=trace` to see the registry's internal events.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc;
use std::thread;

use listeners::{CallQueue, Listeners, NotificationKind, ThreadCallQueue};
use tracing_subscriber::EnvFilter;

trait Download: Send + Sync {
    fn progress(&self, percent: u32);
    fn finished(&self);
}

#[derive(Default)]
struct ProgressBar {
    updates_seen: AtomicU32,
}

impl Download for ProgressBar {
    fn progress(&self, percent: u32) {
        self.updates_seen.fetch_add(1, Ordering::Relaxed);
        println!("progress: {percent}%");
    }

    fn finished(&self) {
        println!(
            "finished after seeing {} progress updates",
            self.updates_seen.load(Ordering::Relaxed)
        );
    }
}

const PROGRESS: NotificationKind = NotificationKind::named("progress");

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let listeners = Arc::new(Listeners::<dyn Download>::new());
    let ui = Arc::new(ThreadCallQueue::new("ui"));

    let bar: Arc<dyn Download> = Arc::new(ProgressBar::default());
    listeners.add(Arc::clone(&bar), Arc::clone(&ui) as Arc<dyn CallQueue>);

    let producer = thread::spawn({
        let listeners = Arc::clone(&listeners);

        move || {
            for percent in 0..=100 {
                listeners.update_with(PROGRESS, move |download| download.progress(percent));
            }

            listeners.queue(|download| download.finished());
        }
    });

    producer.join().unwrap();

    // Let the UI thread catch up. Anything still queued after remove() is skipped.
    let (tx, rx) = mpsc::channel();
    ui.enqueue(Box::new(move || tx.send(()).unwrap()));
    rx.recv().unwrap();

    listeners.remove(&bar);
}
