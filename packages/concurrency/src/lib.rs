#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Synchronization primitives for sharing objects between threads.
//!
//! This crate provides the building blocks that concurrent notification systems are built on:
//!
//! * [`RefCount`] - a lock-free reference count that panics on over-release.
//! * [`Shared<T>`] - a reference-counted handle to a [`SharedObject`], whose teardown is by
//!   default deferred to a background [`Reclaimer`] so that releasing the last reference on a
//!   latency-sensitive thread never blocks on destructors.
//! * [`Semaphore`] - a counting semaphore with an explicit FIFO list of waiting threads.
//! * [`InitGate`] - a lock-free gate that runs an initialization routine exactly once.
//! * [`StaticObject<T>`] - a process-wide value created on first access through an [`InitGate`].
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::thread;
//!
//! use concurrency::{Semaphore, Shared, SharedObject};
//!
//! struct Message(String);
//!
//! impl SharedObject for Message {}
//!
//! let ready = Arc::new(Semaphore::new(0));
//! let message = Shared::new(Message("hello".to_string()));
//!
//! let consumer = thread::spawn({
//!     let ready = Arc::clone(&ready);
//!     let message = message.clone();
//!
//!     move || {
//!         ready.wait();
//!         message.0.len()
//!     }
//! });
//!
//! ready.signal(1);
//! assert_eq!(consumer.join().unwrap(), 5);
//! ```
//!
//! # Errors
//!
//! Misuse that would corrupt shared state (releasing a reference twice, ending an initialization
//! that was never begun) panics. Timeouts are ordinary outcomes and are reported as `bool`.

mod init_gate;
mod reclaimer;
mod ref_count;
mod semaphore;
mod shared;
mod static_object;

pub use init_gate::*;
pub use reclaimer::*;
pub use ref_count::*;
pub use semaphore::*;
pub use shared::*;
pub use static_object::*;
