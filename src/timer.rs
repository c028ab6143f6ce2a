//! Deadline-ordered timer queue backing `delay` and timeout machinery.
//!
//! Mirrors `fiber::future::Timer`/`Sleep` and `fiber::async::sleep`,
//! reimplemented without the Tarantool event-loop clock: deadlines are
//! plain `std::time::Instant`s and firing is driven entirely by the
//! scheduler's own tick loop instead of a coio timer.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};
use std::time::Instant;

use crate::error::{Error, Result};
use crate::job;
use crate::util::IdGenerator;

#[derive(Debug)]
struct Entry {
    deadline: Instant,
    seq: u64,
    id: u64,
    waker: Option<Waker>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline (and,
        // among ties, the earliest registration) sorts first.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A registration returned by [`TimerQueue::register`], usable to cancel
/// before it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(u64);

/// A min-heap of pending wakeups ordered by deadline, ties broken by
/// registration order (§4.D: "ties broken by registration order").
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Entry>,
    seq: IdGenerator,
    ids: IdGenerator,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            seq: IdGenerator::new(),
            ids: IdGenerator::new(),
        }
    }

    /// Registers a waker to be woken no earlier than `deadline`. The
    /// caller re-checks its own condition upon waking, same as any other
    /// future — the queue promises "not woken too early", not "woken
    /// exactly once".
    pub fn register(&mut self, deadline: Instant, waker: Waker) -> TimerId {
        let id = self.ids.next();
        self.heap.push(Entry {
            deadline,
            seq: self.seq.next(),
            id,
            waker: Some(waker),
        });
        TimerId(id)
    }

    /// Removes a still-pending registration. No-op if it already fired.
    pub fn cancel(&mut self, id: TimerId) {
        self.heap.retain(|e| e.id != id.0);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.deadline)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Fires and removes exactly one due timer, if any, returning its
    /// waker. The scheduler calls this once per tick so firing a timer
    /// counts as one unit of scheduler work, same as resuming one job.
    pub fn pop_due(&mut self, now: Instant) -> Option<Waker> {
        if self.heap.peek().map(|e| e.deadline <= now) == Some(true) {
            self.heap.pop().and_then(|mut e| e.waker.take())
        } else {
            None
        }
    }
}

/// The future behind `delay`/`pause`/timeout machinery: suspends the
/// current fiber until `deadline` has passed, registering and
/// re-registering itself with the current thread's scheduler on every
/// poll that finds the deadline not yet reached.
struct Deadline {
    deadline: Instant,
    id: Option<TimerId>,
}

impl Future for Deadline {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        if let Some(err) = job::check_cancelled(cx.waker()) {
            return Poll::Ready(Err(err));
        }
        if Instant::now() >= self.deadline {
            return Poll::Ready(Ok(()));
        }
        self.id = Some(crate::scheduler::register_timer(self.deadline, cx.waker().clone()));
        Poll::Pending
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            crate::scheduler::cancel_timer(id);
        }
    }
}

/// Suspends the calling fiber until `deadline`, via the current thread's
/// scheduler. Returns immediately (without ever registering a timer) if
/// the deadline has already passed. A cancellable suspension point per
/// §5: notices `cancel()` on the next poll and resolves to
/// [`Error::Cancelled`] instead of waiting out the rest of the deadline.
pub(crate) fn await_deadline(deadline: Instant) -> impl Future<Output = Result<()>> {
    Deadline { deadline, id: None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    fn recording_waker(order: Rc<RefCell<Vec<&'static str>>>, tag: &'static str) -> Waker {
        use crate::waker::RcWake;

        struct Recorder {
            order: Rc<RefCell<Vec<&'static str>>>,
            tag: &'static str,
        }
        impl RcWake for Recorder {
            fn wake_by_ref(self: &Rc<Self>) {
                self.order.borrow_mut().push(self.tag);
            }
        }
        Rc::new(Recorder { order, tag }).into_waker()
    }

    #[test]
    fn pop_due_fires_in_deadline_order() {
        let mut q = TimerQueue::new();
        let base = Instant::now();
        let order = Rc::new(RefCell::new(Vec::new()));
        q.register(base + Duration::from_millis(20), recording_waker(order.clone(), "b"));
        q.register(base + Duration::from_millis(10), recording_waker(order.clone(), "a"));
        q.register(base + Duration::from_millis(30), recording_waker(order.clone(), "c"));

        let now = base + Duration::from_millis(25);
        while let Some(waker) = q.pop_due(now) {
            waker.wake();
        }
        assert_eq!(*order.borrow(), vec!["a", "b"]);
        assert_eq!(q.next_deadline(), Some(base + Duration::from_millis(30)));
    }

    #[test]
    fn ties_break_by_registration_order() {
        let mut q = TimerQueue::new();
        let deadline = Instant::now();
        let order = Rc::new(RefCell::new(Vec::new()));
        q.register(deadline, recording_waker(order.clone(), "first"));
        q.register(deadline, recording_waker(order.clone(), "second"));

        q.pop_due(deadline).unwrap().wake();
        q.pop_due(deadline).unwrap().wake();
        assert_eq!(*order.borrow(), vec!["first", "second"]);
    }

    #[test]
    fn cancel_removes_a_pending_timer() {
        let mut q = TimerQueue::new();
        let deadline = Instant::now();
        let order = Rc::new(RefCell::new(Vec::new()));
        let id = q.register(deadline, recording_waker(order.clone(), "cancelled"));
        q.cancel(id);
        assert!(q.pop_due(deadline).is_none());
    }

    #[test]
    fn empty_queue_has_no_next_deadline() {
        let q = TimerQueue::new();
        assert!(q.is_empty());
        assert_eq!(q.next_deadline(), None);
    }
}
