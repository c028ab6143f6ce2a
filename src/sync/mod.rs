//! In-process and cross-process mutual exclusion.
//!
//! [`Mutex`] is the in-fiber primitive ordinary code reaches for; guards may
//! be held across `.await` points, matching `fiber::async::Mutex`.
//! [`CrossProcessMutex`] is the OS-provided mutual exclusion surface used
//! to guard state shared with worker processes (cross-process channel
//! records, a shared result segment); the concrete file-lock/semaphore/
//! shared-cache primitive behind it is an external collaborator out of
//! scope for this crate, so it is expressed as the [`MutexBackend`] trait
//! rather than one fixed implementation.

mod mutex;

pub use mutex::{CrossProcessMutex, Mutex, MutexBackend, MutexGuard};
