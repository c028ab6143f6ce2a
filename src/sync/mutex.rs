//! See [`Mutex`] and [`CrossProcessMutex`] for the two mutual-exclusion
//! primitives this module exports.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::job;

/// Default spacing between polls of a [`CrossProcessMutex`]'s backend while
/// blocked in [`CrossProcessMutex::acquire`], which polls in a bounded
/// loop rather than blocking the OS thread.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// An in-process async mutex. `lock().await` suspends the current fiber
/// instead of blocking the scheduler thread; the guard may be held across
/// further `.await` points. Mirrors `fiber::async::Mutex`, generalized
/// here to resolve a parked `lock()` with `Error::Cancelled` when the
/// waiting job is cancelled, matching every other suspension point in
/// this crate.
#[derive(Debug)]
pub struct Mutex<T: ?Sized> {
    locked: Cell<bool>,
    wakers: RefCell<VecDeque<Waker>>,
    data: UnsafeCell<T>,
}

impl<T: ?Sized> Mutex<T> {
    /// Creates a new mutex in an unlocked state.
    pub fn new(value: T) -> Self
    where
        T: Sized,
    {
        Mutex {
            data: UnsafeCell::new(value),
            locked: Cell::new(false),
            wakers: RefCell::new(VecDeque::new()),
        }
    }

    /// Suspends the current fiber until the lock is acquired.
    pub async fn lock(&self) -> Result<MutexGuard<'_, T>> {
        Lock { mutex: self }.await
    }

    /// Acquires the lock if it is free, without suspending.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.locked.replace(true) {
            None
        } else {
            Some(MutexGuard { mutex: self })
        }
    }

    /// Equivalent to dropping `guard`; spelled out for readers used to an
    /// explicit unlock call.
    pub fn unlock(guard: MutexGuard<'_, T>) {
        drop(guard);
    }

    pub fn into_inner(self) -> T
    where
        T: Sized,
    {
        self.data.into_inner()
    }

    /// A mutable borrow of `self` statically proves no guard is live, so
    /// this bypasses locking entirely.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn add_waker(&self, waker: &Waker) {
        self.wakers.borrow_mut().push_back(waker.clone());
    }

    fn wake_one(&self) {
        if let Some(waker) = self.wakers.borrow_mut().pop_front() {
            waker.wake();
        }
    }
}

impl<T> From<T> for Mutex<T> {
    fn from(value: T) -> Self {
        Mutex::new(value)
    }
}

impl<T: ?Sized + Default> Default for Mutex<T> {
    fn default() -> Self {
        Mutex::new(Default::default())
    }
}

struct Lock<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

impl<'a, T: ?Sized> Future for Lock<'a, T> {
    type Output = Result<MutexGuard<'a, T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<MutexGuard<'a, T>>> {
        if let Some(err) = job::check_cancelled(cx.waker()) {
            return Poll::Ready(Err(err));
        }
        if self.mutex.locked.replace(true) {
            self.mutex.add_waker(cx.waker());
            Poll::Pending
        } else {
            Poll::Ready(Ok(MutexGuard { mutex: self.mutex }))
        }
    }
}

/// A held [`Mutex`] lock. Releases on drop and wakes the next parked waiter,
/// if any.
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

impl<'a, T: ?Sized> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.locked.set(false);
        self.mutex.wake_one();
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// The OS-level exclusion primitive behind a [`CrossProcessMutex`]: a file
/// lock, a named semaphore, or a shared-cache CAS, per §5. Concrete
/// backends are external collaborators (§1 non-goals) the embedding
/// application supplies; this crate only defines the contract and the
/// polling loop that drives it.
pub trait MutexBackend {
    /// Attempts to acquire the lock without blocking. Returns `Ok(true)` on
    /// success, `Ok(false)` if another process currently holds it.
    fn try_acquire(&self) -> Result<bool>;

    /// Releases a lock previously acquired via `try_acquire`.
    fn release(&self) -> Result<()>;
}

/// Cross-process mutual exclusion over a [`MutexBackend`] (§5, §6).
/// `acquire` polls the backend on a bounded interval rather than blocking
/// the scheduler thread, so other fibers keep making progress while a
/// caller waits for a cross-process lock.
pub struct CrossProcessMutex<B> {
    backend: B,
    poll_interval: Duration,
}

impl<B: MutexBackend> CrossProcessMutex<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(backend: B, poll_interval: Duration) -> Self {
        Self {
            backend,
            poll_interval,
        }
    }

    /// Acquires the lock. When `blocking` is `true`, polls the backend
    /// until it succeeds or `timeout_ms` elapses (`None` means wait
    /// indefinitely); exceeding the timeout raises `Error::Timeout` (§6).
    /// When `blocking` is `false`, makes a single attempt and raises
    /// `Error::Timeout` immediately if the backend is currently held
    /// elsewhere.
    pub async fn acquire(
        &self,
        blocking: bool,
        timeout_ms: Option<u64>,
    ) -> Result<CrossProcessGuard<'_, B>> {
        if self.backend.try_acquire()? {
            return Ok(CrossProcessGuard { mutex: self });
        }
        if !blocking {
            return Err(Error::Timeout);
        }

        let deadline =
            timeout_ms.map(|ms| std::time::Instant::now() + Duration::from_millis(ms));
        loop {
            crate::structured::delay(self.poll_interval.as_millis() as u64).await?;
            if self.backend.try_acquire()? {
                return Ok(CrossProcessGuard { mutex: self });
            }
            if let Some(deadline) = deadline {
                if std::time::Instant::now() >= deadline {
                    return Err(Error::Timeout);
                }
            }
        }
    }

    /// Attempts to acquire the lock once, without suspending or polling.
    pub fn try_acquire(&self) -> Result<Option<CrossProcessGuard<'_, B>>> {
        if self.backend.try_acquire()? {
            Ok(Some(CrossProcessGuard { mutex: self }))
        } else {
            Ok(None)
        }
    }
}

/// A held [`CrossProcessMutex`] lock. Releases the backend on drop; a
/// release failure is logged rather than propagated, since `Drop` cannot
/// return a `Result`.
pub struct CrossProcessGuard<'a, B: MutexBackend> {
    mutex: &'a CrossProcessMutex<B>,
}

impl<'a, B: MutexBackend> Drop for CrossProcessGuard<'a, B> {
    fn drop(&mut self) {
        if let Err(err) = self.mutex.backend.release() {
            log::warn!("failed to release cross-process mutex: {err}");
        }
    }
}
