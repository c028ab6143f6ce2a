//! `SharedFlow`: a hot, multicast stream (§4.I).
//!
//! Grounded on `fiber::async::watch`'s single-slot "latest value plus a
//! waker list woken on every send" shape, generalized from one retained
//! value to a bounded ring buffer so multiple recent values can be replayed
//! to a newly-subscribing collector. Cursor tracking (`Weak<Cursor>` per
//! subscription, reaped lazily) mirrors `watch::State`'s waker bookkeeping;
//! unlike `watch`, a `SharedFlow` collector that falls behind does not miss
//! intermediate values as long as they're still within the replay window.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

use crate::error::{Error, Result};
use crate::job;

use super::BackpressureStrategy;

struct Cursor {
    next: Cell<u64>,
    waker: RefCell<Option<Waker>>,
}

enum PushResult<T> {
    Done,
    WouldBlock(T),
    Overflow(T),
}

struct Inner<T> {
    capacity: usize,
    replay: usize,
    strategy: BackpressureStrategy,
    buffer: RefCell<VecDeque<T>>,
    base_seq: Cell<u64>,
    next_seq: Cell<u64>,
    cursors: RefCell<Vec<Weak<Cursor>>>,
    emit_waiters: RefCell<VecDeque<Waker>>,
}

impl<T> Inner<T> {
    fn is_full(&self) -> bool {
        self.buffer.borrow().len() >= self.capacity
    }

    fn min_live_cursor_next(&self) -> Option<u64> {
        let mut cursors = self.cursors.borrow_mut();
        cursors.retain(|w| w.strong_count() > 0);
        cursors.iter().filter_map(Weak::upgrade).map(|c| c.next.get()).min()
    }

    /// Evicts entries from the head while every live cursor has already
    /// advanced past them, so a SUSPEND emitter can make room without ever
    /// discarding a value a collector still needs (§9 open-question
    /// resolution: slowest-collector semantics).
    fn try_trim(&self) {
        loop {
            if self.buffer.borrow().len() <= self.capacity {
                return;
            }
            let base = self.base_seq.get();
            let can_evict = match self.min_live_cursor_next() {
                Some(min_next) => min_next > base,
                None => true,
            };
            if !can_evict {
                return;
            }
            self.buffer.borrow_mut().pop_front();
            self.base_seq.set(base + 1);
        }
    }

    fn wake_cursors(&self) {
        for cursor in self.cursors.borrow().iter().filter_map(Weak::upgrade) {
            if let Some(waker) = cursor.waker.borrow_mut().take() {
                waker.wake();
            }
        }
    }

    fn wake_one_emit_waiter(&self) {
        if !self.is_full() {
            if let Some(waker) = self.emit_waiters.borrow_mut().pop_front() {
                waker.wake();
            }
        }
    }

    fn push_value(&self, value: T) {
        self.buffer.borrow_mut().push_back(value);
        self.next_seq.set(self.next_seq.get() + 1);
        self.wake_cursors();
    }

    fn try_push(&self, value: T) -> PushResult<T> {
        match self.strategy {
            BackpressureStrategy::Suspend => {
                if self.is_full() {
                    self.try_trim();
                }
                if self.is_full() {
                    return PushResult::WouldBlock(value);
                }
                self.push_value(value);
                PushResult::Done
            }
            BackpressureStrategy::DropOldest => {
                if self.is_full() {
                    self.buffer.borrow_mut().pop_front();
                    self.base_seq.set(self.base_seq.get() + 1);
                }
                self.push_value(value);
                PushResult::Done
            }
            BackpressureStrategy::DropLatest => {
                if !self.is_full() {
                    self.push_value(value);
                }
                PushResult::Done
            }
            BackpressureStrategy::Error => {
                if self.is_full() {
                    return PushResult::Overflow(value);
                }
                self.push_value(value);
                PushResult::Done
            }
        }
    }
}

/// A hot multicast stream: every live [`Subscription`] observes the same
/// emissions, plus up to `replay` values that preceded its subscription
/// (§4.I). Cloning shares the same underlying buffer and cursors.
pub struct SharedFlow<T> {
    inner: Rc<Inner<T>>,
}

impl<T> Clone for SharedFlow<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + 'static> SharedFlow<T> {
    /// `replay` is how many of the most recent values a new subscriber
    /// receives before live emissions; `extra_buffer_capacity` is
    /// additional headroom beyond the replay window before
    /// `strategy` applies. Total buffered capacity is their sum.
    pub fn new(replay: usize, extra_buffer_capacity: usize, strategy: BackpressureStrategy) -> Self {
        SharedFlow {
            inner: Rc::new(Inner {
                capacity: replay + extra_buffer_capacity,
                replay,
                strategy,
                buffer: RefCell::new(VecDeque::new()),
                base_seq: Cell::new(0),
                next_seq: Cell::new(0),
                cursors: RefCell::new(Vec::new()),
                emit_waiters: RefCell::new(VecDeque::new()),
            }),
        }
    }

    /// Subscribes a new collector. It first observes the replay window
    /// (the up-to-`replay` most recent values buffered at this moment), in
    /// emission order, then every subsequent emission.
    pub fn subscribe(&self) -> Subscription<T> {
        let buffered = self.inner.buffer.borrow().len() as u64;
        let start = if self.inner.replay > 0 {
            self.inner.next_seq.get() - buffered.min(self.inner.replay as u64)
        } else {
            self.inner.next_seq.get()
        };
        let cursor = Rc::new(Cursor {
            next: Cell::new(start),
            waker: RefCell::new(None),
        });
        self.inner.cursors.borrow_mut().push(Rc::downgrade(&cursor));
        Subscription {
            inner: self.inner.clone(),
            cursor,
        }
    }

    /// Suspends (under `SUSPEND`) until room is available, otherwise
    /// applies `strategy` immediately. Raises `Error::BufferOverflow` only
    /// under the `ERROR` strategy when the buffer is full.
    pub fn emit(&self, value: T) -> Emit<'_, T> {
        Emit {
            flow: self,
            value: Some(value),
        }
    }

    /// Never suspends. Returns `Ok(false)` exactly when `emit` would have
    /// suspended (`SUSPEND`, buffer full) or raised (`ERROR`, buffer full).
    pub fn try_emit(&self, value: T) -> Result<bool> {
        match self.inner.try_push(value) {
            PushResult::Done => Ok(true),
            PushResult::WouldBlock(_) | PushResult::Overflow(_) => Ok(false),
        }
    }

    pub fn replay(&self) -> usize {
        self.inner.replay
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

/// The future returned by [`SharedFlow::emit`].
pub struct Emit<'a, T> {
    flow: &'a SharedFlow<T>,
    value: Option<T>,
}

impl<'a, T: Clone + 'static> Future for Emit<'a, T> {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        if let Some(err) = job::check_cancelled(cx.waker()) {
            return Poll::Ready(Err(err));
        }
        let value = self.value.take().expect("Emit polled after completion");
        match self.flow.inner.try_push(value) {
            PushResult::Done => Poll::Ready(Ok(())),
            PushResult::WouldBlock(value) => {
                self.value = Some(value);
                self.flow.inner.emit_waiters.borrow_mut().push_back(cx.waker().clone());
                Poll::Pending
            }
            PushResult::Overflow(_) => Poll::Ready(Err(Error::BufferOverflow)),
        }
    }
}

/// A live subscription to a [`SharedFlow`], created by [`SharedFlow::subscribe`].
pub struct Subscription<T> {
    inner: Rc<Inner<T>>,
    cursor: Rc<Cursor>,
}

impl<T: Clone + 'static> Subscription<T> {
    /// Suspends until the next value (replay or live) is available.
    pub fn next(&mut self) -> NextValue<'_, T> {
        NextValue { subscription: self }
    }
}

/// The future returned by [`Subscription::next`].
pub struct NextValue<'a, T> {
    subscription: &'a mut Subscription<T>,
}

impl<'a, T: Clone + 'static> Future for NextValue<'a, T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<T>> {
        if let Some(err) = job::check_cancelled(cx.waker()) {
            return Poll::Ready(Err(err));
        }
        let this = self.get_mut();
        let inner = &this.subscription.inner;
        let seq = this.subscription.cursor.next.get();
        if seq < inner.next_seq.get() {
            let base = inner.base_seq.get();
            let (value, advance_to) = if seq < base {
                (inner.buffer.borrow()[0].clone(), base + 1)
            } else {
                let index = (seq - base) as usize;
                (inner.buffer.borrow()[index].clone(), seq + 1)
            };
            this.subscription.cursor.next.set(advance_to);
            inner.try_trim();
            inner.wake_one_emit_waiter();
            return Poll::Ready(Ok(value));
        }
        *this.subscription.cursor.waker.borrow_mut() = Some(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structured::run_blocking;

    #[test]
    fn late_subscriber_sees_the_replay_window() {
        let flow: SharedFlow<i32> = SharedFlow::new(0, 3, BackpressureStrategy::DropOldest);
        for v in 1..=5 {
            assert!(flow.try_emit(v).unwrap());
        }
        let flow_with_replay: SharedFlow<i32> = SharedFlow::new(3, 0, BackpressureStrategy::DropOldest);
        for v in 1..=5 {
            assert!(flow_with_replay.try_emit(v).unwrap());
        }
        let mut sub = flow_with_replay.subscribe();
        let values = run_blocking(
            async move {
                let mut out = Vec::new();
                for _ in 0..3 {
                    out.push(sub.next().await?);
                }
                Ok(out)
            },
            Default::default(),
        )
        .unwrap();
        assert_eq!(values, vec![3, 4, 5]);
    }

    #[test]
    fn drop_oldest_preserves_the_last_k_values() {
        let flow: SharedFlow<i32> = SharedFlow::new(0, 3, BackpressureStrategy::DropOldest);
        for v in 1..=10 {
            assert!(flow.try_emit(v).unwrap());
        }
        let mut sub = flow.subscribe();
        let values = run_blocking(
            async move {
                let mut out = Vec::new();
                for _ in 0..3 {
                    out.push(sub.next().await?);
                }
                Ok(out)
            },
            Default::default(),
        )
        .unwrap();
        assert_eq!(values, vec![8, 9, 10]);
    }

    #[test]
    fn try_emit_reports_false_on_error_strategy_overflow() {
        let flow: SharedFlow<i32> = SharedFlow::new(0, 1, BackpressureStrategy::Error);
        assert!(flow.try_emit(1).unwrap());
        assert!(!flow.try_emit(2).unwrap());
    }

    #[test]
    fn suspend_strategy_parks_until_the_slowest_collector_advances() {
        let flow: SharedFlow<i32> = SharedFlow::new(0, 1, BackpressureStrategy::Suspend);
        let mut sub = flow.subscribe();
        let result = run_blocking(
            async move {
                flow.emit(1).await?;
                let producer = {
                    let flow = flow.clone();
                    crate::structured::launch(
                        async move {
                            flow.emit(2).await?;
                            Ok(())
                        },
                        Default::default(),
                    )
                };
                let first = sub.next().await?;
                producer.join().await?;
                let second = sub.next().await?;
                Ok((first, second))
            },
            Default::default(),
        );
        assert_eq!(result.unwrap(), (1, 2));
    }
}
