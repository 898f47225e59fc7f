#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Thread-aware listener registry with per-queue delivery and update consolidation.
//!
//! A [`Listeners<L>`] registry holds listeners of some interface type `L`, typically a trait
//! object, each registered together with the [`CallQueue`] its notifications must run on. This
//! lets a producer on any thread notify consumers that live on specific threads, such as a UI
//! thread or an audio thread, without the producer knowing about those threads.
//!
//! Listeners that share a queue form a group. Each notification is allocated once as a pooled
//! [`Call`] and handed to every group's queue, where it is applied to the group's listeners in
//! registration order.
//!
//! Rapidly changing state can be published with [`Listeners::update()`], which replaces a
//! notification of the same [`NotificationKind`] that is still waiting on a queue, so a slow
//! consumer only ever catches up to the latest value.
//!
//! Two call queues are included: [`ManualCallQueue`] runs work when its owning thread asks for
//! it, and [`ThreadCallQueue`] runs work on a dedicated worker thread.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::sync::mpsc;
//!
//! use listeners::{CallQueue, Listeners, NotificationKind, ThreadCallQueue};
//!
//! trait Download: Send + Sync {
//!     fn progress(&self, percent: u32);
//! }
//!
//! struct Reporter(mpsc::Sender<u32>);
//!
//! impl Download for Reporter {
//!     fn progress(&self, percent: u32) {
//!         self.0.send(percent).unwrap();
//!     }
//! }
//!
//! let listeners = Listeners::<dyn Download>::new();
//! let worker = Arc::new(ThreadCallQueue::new("reporter"));
//! let (tx, rx) = mpsc::channel();
//!
//! let reporter: Arc<dyn Download> = Arc::new(Reporter(tx));
//! listeners.add(Arc::clone(&reporter), Arc::clone(&worker) as Arc<dyn CallQueue>);
//!
//! listeners.update_with(NotificationKind::named("progress"), |d| d.progress(100));
//!
//! assert_eq!(rx.recv().unwrap(), 100);
//!
//! listeners.remove(&reporter);
//! ```

mod call;
mod call_queue;
mod error;
mod group;
mod kind;
mod manual_call_queue;
mod proxy;
mod registry;
mod thread_call_queue;

pub use call::{Call, CallPool, Notify};
pub(crate) use call::DEFAULT_CALL_POOL_CAPACITY;
pub use call_queue::*;
pub use error::Error;
pub(crate) use error::Result;
pub(crate) use group::{Group, GroupId, ListenerId};
pub use kind::*;
pub use manual_call_queue::*;
pub(crate) use proxy::{Proxy, Supersede};
pub use registry::*;
pub use thread_call_queue::*;
