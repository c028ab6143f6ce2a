//! Rendezvous and buffered channels.
//!
//! Follows `fiber::channel::Channel`'s API shape — `send`, `recv`,
//! `try_send`, `try_recv`, `close`, forward-only iteration — reimplemented
//! over this crate's own scheduler instead of Tarantool's
//! `ipc::FiberChannel`: parking a sender or receiver here means pushing a
//! waker onto one of the channel's own wait-lists rather than waiting on a
//! libev `ipc_channel`. Queue discipline is FIFO per side, with at most one
//! of sendQueue/recvQueue non-empty at rest.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::error::{Error, Result};
use crate::job;

/// Why a non-blocking send failed.
#[derive(Debug)]
pub enum TrySendError<T> {
    /// No receiver was waiting and the buffer (if any) is full. The value
    /// is handed back so the caller doesn't lose it.
    Full(T),
    /// The channel is closed.
    Closed(T),
}

/// Why a non-blocking receive failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    Empty,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Pending,
    Delivered,
    Closed,
}

struct SendSlot<T> {
    value: RefCell<Option<T>>,
    state: Cell<SlotState>,
    waker: RefCell<Option<Waker>>,
}

impl<T> SendSlot<T> {
    fn new(value: T, waker: Waker) -> Rc<Self> {
        Rc::new(Self {
            value: RefCell::new(Some(value)),
            state: Cell::new(SlotState::Pending),
            waker: RefCell::new(Some(waker)),
        })
    }

    fn wake(&self) {
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
    }
}

struct RecvSlot<T> {
    value: RefCell<Option<T>>,
    state: Cell<SlotState>,
    waker: RefCell<Option<Waker>>,
}

impl<T> RecvSlot<T> {
    fn new(waker: Waker) -> Rc<Self> {
        Rc::new(Self {
            value: RefCell::new(None),
            state: Cell::new(SlotState::Pending),
            waker: RefCell::new(Some(waker)),
        })
    }

    fn wake(&self) {
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
    }
}

struct Inner<T> {
    capacity: usize,
    buffer: RefCell<VecDeque<T>>,
    send_queue: RefCell<VecDeque<Rc<SendSlot<T>>>>,
    recv_queue: RefCell<VecDeque<Rc<RecvSlot<T>>>>,
    closed: Cell<bool>,
}

/// A rendezvous (`capacity == 0`) or buffered (`capacity > 0`) channel.
/// Cloning shares the same underlying queues and buffer.
pub struct Channel<T> {
    inner: Rc<Inner<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Channel<T> {
    /// Creates a rendezvous channel: `send` only completes once a receiver
    /// is ready to take the value directly.
    pub fn rendezvous() -> Self {
        Self::with_capacity(0)
    }

    /// Creates a buffered channel holding up to `capacity` values before a
    /// sender must park.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Rc::new(Inner {
                capacity,
                buffer: RefCell::new(VecDeque::new()),
                send_queue: RefCell::new(VecDeque::new()),
                recv_queue: RefCell::new(VecDeque::new()),
                closed: Cell::new(false),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.buffer.borrow().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.inner.capacity > 0 && self.inner.buffer.borrow().len() >= self.inner.capacity
    }

    pub fn size(&self) -> usize {
        self.inner.buffer.borrow().len()
    }

    /// Suspends the current fiber until the value is handed off (directly
    /// to a parked receiver, or into the buffer) or the channel closes.
    pub fn send(&self, value: T) -> Send<'_, T> {
        Send {
            channel: self,
            value: Some(value),
            slot: None,
        }
    }

    /// Suspends the current fiber until a value is available or the
    /// channel closes.
    pub fn receive(&self) -> Receive<'_, T> {
        Receive {
            channel: self,
            slot: None,
        }
    }

    /// Non-blocking send per §4.G: only ever performs the immediate
    /// sub-case, never parks.
    pub fn try_send(&self, value: T) -> std::result::Result<(), TrySendError<T>> {
        if self.inner.closed.get() {
            return Err(TrySendError::Closed(value));
        }
        if let Some(slot) = self.pop_waiting_receiver() {
            *slot.value.borrow_mut() = Some(value);
            slot.state.set(SlotState::Delivered);
            slot.wake();
            return Ok(());
        }
        if self.inner.capacity > 0 && !self.is_full() {
            self.inner.buffer.borrow_mut().push_back(value);
            return Ok(());
        }
        Err(TrySendError::Full(value))
    }

    /// Non-blocking receive per §4.G: only ever performs the immediate
    /// sub-case, never parks.
    pub fn try_receive(&self) -> std::result::Result<T, TryRecvError> {
        if let Some(value) = self.inner.buffer.borrow_mut().pop_front() {
            self.promote_one_sender();
            return Ok(value);
        }
        if let Some(slot) = self.pop_waiting_sender() {
            let value = slot
                .value
                .borrow_mut()
                .take()
                .expect("pending send slot always holds a value");
            slot.state.set(SlotState::Delivered);
            slot.wake();
            return Ok(value);
        }
        if self.inner.closed.get() {
            Err(TryRecvError::Closed)
        } else {
            Err(TryRecvError::Empty)
        }
    }

    /// Closes the channel. Idempotent. Every parked sender and receiver is
    /// resumed with `ChannelClosed`; values already in the buffer remain
    /// receivable until drained (§4.G, §8 law 3).
    pub fn close(&self) {
        if self.inner.closed.replace(true) {
            return;
        }
        log::debug!("channel closed with {} buffered value(s)", self.inner.buffer.borrow().len());
        for slot in self.inner.recv_queue.borrow_mut().drain(..) {
            slot.state.set(SlotState::Closed);
            slot.wake();
        }
        for slot in self.inner.send_queue.borrow_mut().drain(..) {
            slot.state.set(SlotState::Closed);
            slot.wake();
        }
    }

    /// A forward-only receive iterator. Each call produces a fresh
    /// iterator starting "now"; there is no way to rewind one that has
    /// already observed `ChannelClosed`, matching §4.G's "re-starting
    /// iteration is an error" by simply not exposing a rewind operation.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { channel: self }
    }

    /// Puts a value that was already handed to a parked receiver back into
    /// circulation instead of letting it vanish — used when a `select`
    /// clause that already won its race against an external sender turns
    /// out to have lost the overall `select` to a sibling clause and gets
    /// abandoned. Hands it to another waiting receiver if one exists,
    /// otherwise pushes it to the front of the buffer so the next
    /// `receive`/`try_receive` on this channel sees it first, preserving
    /// the order it actually arrived in.
    fn requeue_delivered(&self, value: T) {
        if let Some(slot) = self.pop_waiting_receiver() {
            *slot.value.borrow_mut() = Some(value);
            slot.state.set(SlotState::Delivered);
            slot.wake();
            return;
        }
        self.inner.buffer.borrow_mut().push_front(value);
    }

    fn pop_waiting_receiver(&self) -> Option<Rc<RecvSlot<T>>> {
        self.inner.recv_queue.borrow_mut().pop_front()
    }

    fn pop_waiting_sender(&self) -> Option<Rc<SendSlot<T>>> {
        self.inner.send_queue.borrow_mut().pop_front()
    }

    /// After a receive pops the buffer's head, move one parked sender's
    /// value into the freed slot (§4.G buffered rule 2).
    fn promote_one_sender(&self) {
        if let Some(slot) = self.pop_waiting_sender() {
            if let Some(value) = slot.value.borrow_mut().take() {
                self.inner.buffer.borrow_mut().push_back(value);
                slot.state.set(SlotState::Delivered);
                slot.wake();
            }
        }
    }
}

/// The future returned by [`Channel::send`].
pub struct Send<'a, T> {
    channel: &'a Channel<T>,
    value: Option<T>,
    slot: Option<Rc<SendSlot<T>>>,
}

impl<'a, T> Send<'a, T> {
    /// Removes this registration from the channel's send queue if it is
    /// still parked. See [`Receive::abandon`].
    pub(crate) fn abandon(&mut self) {
        if let Some(slot) = self.slot.take() {
            if slot.state.get() == SlotState::Pending {
                self.channel
                    .inner
                    .send_queue
                    .borrow_mut()
                    .retain(|s| !Rc::ptr_eq(s, &slot));
            }
        }
    }
}

impl<'a, T> Future for Send<'a, T> {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        if let Some(slot) = self.slot.clone() {
            return match slot.state.get() {
                SlotState::Pending => {
                    if let Some(err) = job::check_cancelled(cx.waker()) {
                        self.channel
                            .inner
                            .send_queue
                            .borrow_mut()
                            .retain(|s| !Rc::ptr_eq(s, &slot));
                        return Poll::Ready(Err(err));
                    }
                    *slot.waker.borrow_mut() = Some(cx.waker().clone());
                    Poll::Pending
                }
                SlotState::Delivered => Poll::Ready(Ok(())),
                SlotState::Closed => Poll::Ready(Err(Error::ChannelClosed)),
            };
        }

        let value = self.value.take().expect("Send polled after completion");
        let channel = self.channel;
        if channel.inner.closed.get() {
            return Poll::Ready(Err(Error::ChannelClosed));
        }
        if let Some(recv_slot) = channel.pop_waiting_receiver() {
            *recv_slot.value.borrow_mut() = Some(value);
            recv_slot.state.set(SlotState::Delivered);
            recv_slot.wake();
            return Poll::Ready(Ok(()));
        }
        if channel.inner.capacity > 0 && !channel.is_full() {
            channel.inner.buffer.borrow_mut().push_back(value);
            return Poll::Ready(Ok(()));
        }
        let slot = SendSlot::new(value, cx.waker().clone());
        channel.inner.send_queue.borrow_mut().push_back(slot.clone());
        self.slot = Some(slot);
        Poll::Pending
    }
}

/// The future returned by [`Channel::receive`].
pub struct Receive<'a, T> {
    channel: &'a Channel<T>,
    slot: Option<Rc<RecvSlot<T>>>,
}

impl<'a, T> Receive<'a, T> {
    /// Removes this registration from the channel's receive queue if it is
    /// still parked. Used by [`crate::select`] so the clause that does not
    /// win a `select` doesn't linger in the channel's queue waiting for a
    /// value nobody will read.
    ///
    /// If a sender had already delivered directly into this slot before
    /// the clause lost the race (two clauses can each be handed a value by
    /// an external sender in between two polls of the `select`'s future),
    /// that value is handed back to the channel via
    /// [`Channel::requeue_delivered`] instead of being dropped — the
    /// sender already completed believing its send succeeded, so the
    /// value must stay observable to a later `receive`.
    pub(crate) fn abandon(&mut self) {
        if let Some(slot) = self.slot.take() {
            match slot.state.get() {
                SlotState::Pending => {
                    self.channel
                        .inner
                        .recv_queue
                        .borrow_mut()
                        .retain(|s| !Rc::ptr_eq(s, &slot));
                }
                SlotState::Delivered => {
                    if let Some(value) = slot.value.borrow_mut().take() {
                        self.channel.requeue_delivered(value);
                    }
                }
                SlotState::Closed => {}
            }
        }
    }
}

impl<'a, T> Future for Receive<'a, T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<T>> {
        if let Some(slot) = self.slot.clone() {
            return match slot.state.get() {
                SlotState::Pending => {
                    if let Some(err) = job::check_cancelled(cx.waker()) {
                        self.channel
                            .inner
                            .recv_queue
                            .borrow_mut()
                            .retain(|s| !Rc::ptr_eq(s, &slot));
                        return Poll::Ready(Err(err));
                    }
                    *slot.waker.borrow_mut() = Some(cx.waker().clone());
                    Poll::Pending
                }
                SlotState::Delivered => Poll::Ready(Ok(slot
                    .value
                    .borrow_mut()
                    .take()
                    .expect("delivered recv slot always holds a value"))),
                SlotState::Closed => Poll::Ready(Err(Error::ChannelClosed)),
            };
        }

        let channel = self.channel;
        if let Some(value) = channel.inner.buffer.borrow_mut().pop_front() {
            channel.promote_one_sender();
            return Poll::Ready(Ok(value));
        }
        if let Some(send_slot) = channel.pop_waiting_sender() {
            let value = send_slot
                .value
                .borrow_mut()
                .take()
                .expect("pending send slot always holds a value");
            send_slot.state.set(SlotState::Delivered);
            send_slot.wake();
            return Poll::Ready(Ok(value));
        }
        if channel.inner.closed.get() {
            return Poll::Ready(Err(Error::ChannelClosed));
        }
        let slot = RecvSlot::new(cx.waker().clone());
        channel.inner.recv_queue.borrow_mut().push_back(slot.clone());
        self.slot = Some(slot);
        Poll::Pending
    }
}

/// Forward-only receive iterator returned by [`Channel::iter`].
pub struct Iter<'a, T> {
    channel: &'a Channel<T>,
}

impl<'a, T> Iter<'a, T> {
    /// Receives the next value, `Ok(None)` once the channel is closed and
    /// its buffer has drained, or `Err` for any other failure (notably
    /// `Error::Cancelled` if the current fiber is cancelled while parked
    /// here) — only `ChannelClosed` means "end of stream", per §4.G.
    pub async fn next(&mut self) -> Result<Option<T>> {
        match self.channel.receive().await {
            Ok(value) => Ok(Some(value)),
            Err(Error::ChannelClosed) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{drain_ticks, noop_context};
    use std::task::Poll;

    #[test]
    fn try_send_then_try_receive_rendezvous_round_trips() {
        let ch = Channel::with_capacity(0);
        // No receiver parked and capacity 0 means try_send always reports full.
        assert!(matches!(ch.try_send(1), Err(TrySendError::Full(1))));
    }

    #[test]
    fn buffered_try_send_respects_capacity() {
        let ch = Channel::with_capacity(2);
        assert!(ch.try_send(1).is_ok());
        assert!(ch.try_send(2).is_ok());
        assert!(matches!(ch.try_send(3), Err(TrySendError::Full(3))));
        assert_eq!(ch.size(), 2);
        assert!(ch.is_full());
    }

    #[test]
    fn try_receive_reports_empty_then_closed() {
        let ch: Channel<i32> = Channel::with_capacity(1);
        assert_eq!(ch.try_receive(), Err(TryRecvError::Empty));
        ch.close();
        assert_eq!(ch.try_receive(), Err(TryRecvError::Closed));
    }

    #[test]
    fn close_wakes_parked_receiver_with_channel_closed() {
        let ch: Channel<i32> = Channel::with_capacity(0);
        let mut recv = ch.receive();
        let mut cx = noop_context();
        assert!(matches!(Future::poll(Pin::new(&mut recv), &mut cx), Poll::Pending));
        ch.close();
        match Future::poll(Pin::new(&mut recv), &mut cx) {
            Poll::Ready(Err(Error::ChannelClosed)) => {}
            other => panic!("expected ChannelClosed, got {other:?}"),
        }
    }

    #[test]
    fn buffered_drain_after_close_still_succeeds_until_empty() {
        let ch = Channel::with_capacity(2);
        ch.try_send(1).unwrap();
        ch.close();
        assert_eq!(ch.try_receive(), Ok(1));
        assert_eq!(ch.try_receive(), Err(TryRecvError::Closed));
    }

    #[test]
    fn rendezvous_hands_value_directly_to_parked_receiver() {
        let mut scheduler = crate::scheduler::Scheduler::new();
        let ch: Channel<&'static str> = Channel::rendezvous();
        let received = Rc::new(RefCell::new(Vec::new()));
        let received2 = received.clone();
        let ch2 = ch.clone();
        crate::structured::launch(
            async move {
                ch2.send("hi").await?;
                ch2.send("bye").await?;
                Ok(())
            },
            Default::default(),
        );
        let ch3 = ch.clone();
        crate::structured::launch(
            async move {
                received2.borrow_mut().push(ch3.receive().await?);
                received2.borrow_mut().push(ch3.receive().await?);
                Ok(())
            },
            Default::default(),
        );
        drain_ticks(&mut scheduler);
        assert_eq!(*received.borrow(), vec!["hi", "bye"]);
    }

    #[test]
    fn iter_stops_at_channel_closed_only() {
        let ch: Channel<i32> = Channel::with_capacity(1);
        ch.try_send(1).unwrap();
        ch.close();
        let result = crate::structured::run_blocking(
            async move {
                let mut it = ch.iter();
                let first = it.next().await?;
                let second = it.next().await?;
                Ok((first, second))
            },
            Default::default(),
        );
        assert_eq!(result.unwrap(), (Some(1), None));
    }

    #[test]
    fn iter_propagates_cancellation_instead_of_ending_the_stream() {
        let mut scheduler = crate::scheduler::Scheduler::new();
        let ch: Channel<i32> = Channel::rendezvous();
        let saw_error = Rc::new(RefCell::new(None));
        let saw_error2 = saw_error.clone();
        let job = crate::structured::launch(
            async move {
                let mut it = ch.iter();
                let result = it.next().await;
                *saw_error2.borrow_mut() = Some(result.is_err());
                Ok(())
            },
            Default::default(),
        );
        // Drive the fiber until it parks inside `receive`.
        drain_ticks(&mut scheduler);
        job.cancel();
        drain_ticks(&mut scheduler);
        assert_eq!(*saw_error.borrow(), Some(true));
    }
}
