//! `StateFlow`: a hot stream that always holds a current value.
//!
//! Built on `fiber::async::watch::{Sender, Receiver}` — a single cell plus
//! a list of wakers notified on every write — the same way
//! [`super::shared`] builds `SharedFlow` on top of it: here the cell is
//! never empty (`replay = 1` and a value is required at construction) and
//! writes that don't change the value (by `PartialEq`) are no-ops,
//! matching `watch::Sender::send_if_modified`'s "skip the notification
//! when nothing changed" shape.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

use crate::error::Result;
use crate::job;

struct Cursor {
    seen_version: Cell<u64>,
    waker: RefCell<Option<Waker>>,
}

struct Inner<T> {
    value: RefCell<T>,
    version: Cell<u64>,
    cursors: RefCell<Vec<Weak<Cursor>>>,
}

impl<T: PartialEq> Inner<T> {
    fn wake_cursors(&self) {
        let mut cursors = self.cursors.borrow_mut();
        cursors.retain(|w| w.strong_count() > 0);
        for cursor in cursors.iter().filter_map(Weak::upgrade) {
            if let Some(waker) = cursor.waker.borrow_mut().take() {
                waker.wake();
            }
        }
    }

    /// Writes `new` unless it equals the currently held value, per §3's
    /// "setting equal value... does not bump version" invariant. Returns
    /// whether the write actually happened.
    fn set_if_changed(&self, new: T) -> bool {
        {
            let current = self.value.borrow();
            if *current == new {
                return false;
            }
        }
        *self.value.borrow_mut() = new;
        self.version.set(self.version.get() + 1);
        self.wake_cursors();
        true
    }
}

/// A hot stream that always has a current value, with `replay = 1` and
/// `compareAndSet`/`update` built on top of [`PartialEq`] (§4.I). Cloning
/// shares the same underlying cell and subscriber list.
pub struct StateFlow<T> {
    inner: Rc<Inner<T>>,
}

impl<T> Clone for StateFlow<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + PartialEq + 'static> StateFlow<T> {
    /// Builds a `StateFlow` already holding `initial` — unlike
    /// `SharedFlow`, there is no way to construct one with no value (§3:
    /// "always has a value").
    pub fn new(initial: T) -> Self {
        StateFlow {
            inner: Rc::new(Inner {
                value: RefCell::new(initial),
                version: Cell::new(0),
                cursors: RefCell::new(Vec::new()),
            }),
        }
    }

    /// The current value.
    pub fn value(&self) -> T {
        self.inner.value.borrow().clone()
    }

    /// Replaces the current value. A no-op (no version bump, no collector
    /// notification) if `value` equals what is already held.
    pub fn set(&self, value: T) {
        self.inner.set_if_changed(value);
    }

    /// Replaces the current value with `f(current)`.
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        let next = f(&self.inner.value.borrow());
        self.inner.set_if_changed(next);
    }

    /// Replaces the current value with `new` only if it currently equals
    /// `expected`. Returns whether the swap happened.
    pub fn compare_and_set(&self, expected: &T, new: T) -> bool {
        if *self.inner.value.borrow() != *expected {
            return false;
        }
        self.inner.set_if_changed(new)
    }

    pub(crate) fn version(&self) -> u64 {
        self.inner.version.get()
    }

    /// Subscribes a new collector. Its first `next().await` resolves
    /// immediately with the current value (the `replay = 1` window), after
    /// which it resolves only once the value actually changes.
    pub fn subscribe(&self) -> Subscription<T> {
        let cursor = Rc::new(Cursor {
            seen_version: Cell::new(self.inner.version.get().wrapping_sub(1)),
            waker: RefCell::new(None),
        });
        self.inner.cursors.borrow_mut().push(Rc::downgrade(&cursor));
        Subscription {
            inner: self.inner.clone(),
            cursor,
        }
    }
}

impl<T: Clone + PartialEq + Default + 'static> Default for StateFlow<T> {
    fn default() -> Self {
        StateFlow::new(T::default())
    }
}

/// A live subscription to a [`StateFlow`], created by [`StateFlow::subscribe`].
pub struct Subscription<T> {
    inner: Rc<Inner<T>>,
    cursor: Rc<Cursor>,
}

impl<T: Clone + PartialEq + 'static> Subscription<T> {
    /// Suspends until the value changes (or, for the very first call,
    /// resolves immediately with the value held at subscription time).
    pub fn next(&mut self) -> NextValue<'_, T> {
        NextValue { subscription: self }
    }
}

/// The future returned by [`Subscription::next`].
pub struct NextValue<'a, T> {
    subscription: &'a mut Subscription<T>,
}

impl<'a, T: Clone + PartialEq + 'static> Future for NextValue<'a, T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<T>> {
        if let Some(err) = job::check_cancelled(cx.waker()) {
            return Poll::Ready(Err(err));
        }
        let this = self.get_mut();
        let current_version = this.subscription.inner.version.get();
        if this.subscription.cursor.seen_version.get() != current_version {
            this.subscription.cursor.seen_version.set(current_version);
            return Poll::Ready(Ok(this.subscription.inner.value.borrow().clone()));
        }
        *this.subscription.cursor.waker.borrow_mut() = Some(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structured::{launch, run_blocking};

    #[test]
    fn always_has_a_value() {
        let flow = StateFlow::new(0);
        assert_eq!(flow.value(), 0);
    }

    #[test]
    fn set_bumps_version_only_on_change() {
        let flow = StateFlow::new(0);
        let before = flow.version();
        flow.set(0);
        assert_eq!(flow.version(), before);
        flow.set(1);
        assert_eq!(flow.version(), before + 1);
    }

    #[test]
    fn new_subscriber_sees_current_value_first() {
        let flow = StateFlow::new(42);
        let mut sub = flow.subscribe();
        let result = run_blocking(async move { sub.next().await }, Default::default());
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn update_applies_a_function_to_the_current_value() {
        let flow = StateFlow::new(10);
        flow.update(|v| v + 5);
        assert_eq!(flow.value(), 15);
    }

    #[test]
    fn compare_and_set_only_swaps_on_matching_expectation() {
        let flow = StateFlow::new(1);
        assert!(!flow.compare_and_set(&99, 2));
        assert_eq!(flow.value(), 1);
        assert!(flow.compare_and_set(&1, 2));
        assert_eq!(flow.value(), 2);
    }

    #[test]
    fn equal_assignments_do_not_notify_collectors() {
        let flow = Rc::new(StateFlow::new(0));
        let flow2 = flow.clone();
        let mut sub = flow.subscribe();
        let result = run_blocking(
            async move {
                let first = sub.next().await?;
                let setter = launch(
                    async move {
                        flow2.set(0);
                        flow2.set(0);
                        flow2.set(1);
                        Ok(())
                    },
                    Default::default(),
                );
                let second = sub.next().await?;
                setter.join().await?;
                Ok((first, second))
            },
            Default::default(),
        );
        assert_eq!(result.unwrap(), (0, 1));
    }
}
