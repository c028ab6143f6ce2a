//! A single-threaded structured-concurrency runtime.
//!
//! Foroutines multiplexes cooperative fibers, timers, non-blocking stream
//! I/O and a child-process worker pool on one OS thread, and layers
//! channels, a `select` multiplexer, and cold/hot flows on top.
//!
//! Modules:
//!
//! - [`error`] — the crate's error type.
//! - [`fiber`] — the stackful-looking, stackless-underneath task primitive.
//! - [`waker`] — `Waker` construction shared by every suspension point.
//! - [`job`] — lifecycle state machine wrapping a fiber.
//! - [`scheduler`] — the ready-queue tick loop and global runtime instance.
//! - [`timer`] — deadline-ordered delay queue.
//! - [`io`] — the AsyncIO poller and non-blocking stream wrapper.
//! - [`worker`] — the child-process worker pool.
//! - [`channel`] — rendezvous and buffered channels.
//! - [`select`] — the single-choice multiplexer over channel operations.
//! - [`flow`] — cold `Flow`, hot `SharedFlow`, and `StateFlow`.
//! - [`sync`] — the async and cross-process mutex.
//! - [`structured`] — `launch`, `async`, `runBlocking`, timeouts, `repeat`.
//! - [`dispatch`] — the `Dispatcher` enum and its routing.
//! - [`driver`] — the top-level `main` entry point.
//! - [`testing`] — test-only helpers, not part of the public API.

pub mod channel;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod fiber;
pub mod flow;
pub mod io;
pub mod job;
pub mod scheduler;
pub mod select;
pub mod structured;
pub mod sync;
pub mod timer;
pub mod util;
pub mod waker;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::Channel;
pub use dispatch::Dispatcher;
pub use driver::main;
pub use error::{Error, Result};
pub use flow::{BackpressureStrategy, Flow, SharedFlow, StateFlow};
pub use job::Job;
pub use select::{select, Select};
pub use structured::{
    delay, launch, pause, repeat, run_blocking, spawn_async, thread_wait, with_timeout,
    with_timeout_or_null, Deferred,
};
pub use sync::Mutex;

/// `std::result::Result` shorthand for interop with fallible std APIs that
/// don't use our [`Error`].
pub type StdResult<T, E> = std::result::Result<T, E>;
