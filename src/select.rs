//! Single-choice multiplexer over channel operations.
//!
//! Builds on `fiber::channel::Channel`'s suspension mechanics, extended to
//! the builder-of-clauses shape `select` needs: each clause
//! wraps one channel operation and a handler; `execute` first scans every
//! clause's non-blocking form in registration order (mirroring
//! `try_send`/`try_receive`'s own ordering), falls back to a `default`
//! clause if none fired, and otherwise parks on all of them, running
//! exactly one handler once any clause becomes ready.
//!
//! The "all other registrations must be deregistered atomically" invariant
//! is implemented by [`crate::channel::Receive::abandon`] /
//! [`crate::channel::Send::abandon`]: once a clause's parked future
//! resolves, every other still-parked clause in this `Select` is abandoned
//! before `execute`'s future returns, in the same poll.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::channel::{Channel, Receive, Send as ChannelSend, TryRecvError, TrySendError};
use crate::error::{Error, Result};

/// One registered clause of a [`Select`]. Type-erased over the channel's
/// element type so clauses of different channels can share one builder.
trait Clause<R> {
    /// Attempts the clause's non-blocking form once, consuming its handler
    /// on success. `None` means "would have blocked"; this must never park.
    fn try_immediate(&mut self) -> Option<Result<R>>;

    /// Polls (creating, on first call) the clause's blocking future.
    fn poll_parked(&mut self, cx: &mut Context<'_>) -> Poll<Result<R>>;

    /// Deregisters this clause's parked future, if any, from its channel's
    /// wait queue without ever having fired its handler.
    fn abandon(&mut self);
}

struct ReceiveClause<'a, T, R> {
    channel: &'a Channel<T>,
    handler: Option<Box<dyn FnOnce(T) -> R + 'a>>,
    parked: Option<Receive<'a, T>>,
}

impl<'a, T, R> Clause<R> for ReceiveClause<'a, T, R> {
    fn try_immediate(&mut self) -> Option<Result<R>> {
        match self.channel.try_receive() {
            Ok(value) => {
                let handler = self.handler.take().expect("clause handler already run");
                Some(Ok(handler(value)))
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(Error::ChannelClosed)),
        }
    }

    fn poll_parked(&mut self, cx: &mut Context<'_>) -> Poll<Result<R>> {
        let channel = self.channel;
        let future = self.parked.get_or_insert_with(|| channel.receive());
        match Pin::new(future).poll(cx) {
            Poll::Ready(Ok(value)) => {
                let handler = self.handler.take().expect("clause handler already run");
                Poll::Ready(Ok(handler(value)))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn abandon(&mut self) {
        if let Some(future) = self.parked.as_mut() {
            future.abandon();
        }
    }
}

struct SendClause<'a, T, R> {
    channel: &'a Channel<T>,
    value: Option<T>,
    handler: Option<Box<dyn FnOnce() -> R + 'a>>,
    parked: Option<ChannelSend<'a, T>>,
}

impl<'a, T, R> Clause<R> for SendClause<'a, T, R> {
    fn try_immediate(&mut self) -> Option<Result<R>> {
        let value = self.value.take().expect("clause value already consumed");
        match self.channel.try_send(value) {
            Ok(()) => {
                let handler = self.handler.take().expect("clause handler already run");
                Some(Ok(handler()))
            }
            Err(TrySendError::Full(value)) => {
                self.value = Some(value);
                None
            }
            Err(TrySendError::Closed(_)) => Some(Err(Error::ChannelClosed)),
        }
    }

    fn poll_parked(&mut self, cx: &mut Context<'_>) -> Poll<Result<R>> {
        let channel = self.channel;
        let value = &mut self.value;
        let future = self
            .parked
            .get_or_insert_with(|| channel.send(value.take().expect("clause value already consumed")));
        match Pin::new(future).poll(cx) {
            Poll::Ready(Ok(())) => {
                let handler = self.handler.take().expect("clause handler already run");
                Poll::Ready(Ok(handler()))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn abandon(&mut self) {
        if let Some(future) = self.parked.as_mut() {
            future.abandon();
        }
    }
}

/// A builder collecting `receive`/`send` clauses and an optional `default`,
/// all yielding the same result type `R` from their handlers (§4.H).
pub struct Select<'a, R> {
    clauses: Vec<Box<dyn Clause<R> + 'a>>,
    default: Option<Box<dyn FnOnce() -> R + 'a>>,
}

impl<'a, R> Select<'a, R> {
    pub fn new() -> Self {
        Self {
            clauses: Vec::new(),
            default: None,
        }
    }

    /// Registers a receive clause: if `channel` has a value available
    /// (directly or via a parked sender), `handler` runs with it.
    pub fn on_receive<T: 'a>(
        mut self,
        channel: &'a Channel<T>,
        handler: impl FnOnce(T) -> R + 'a,
    ) -> Self {
        self.clauses.push(Box::new(ReceiveClause {
            channel,
            handler: Some(Box::new(handler)),
            parked: None,
        }));
        self
    }

    /// Registers a send clause: if `channel` can accept `value` immediately
    /// (a parked receiver, or free buffer space), `handler` runs.
    pub fn on_send<T: 'a>(
        mut self,
        channel: &'a Channel<T>,
        value: T,
        handler: impl FnOnce() -> R + 'a,
    ) -> Self {
        self.clauses.push(Box::new(SendClause {
            channel,
            value: Some(value),
            handler: Some(Box::new(handler)),
            parked: None,
        }));
        self
    }

    /// Registers the fallback clause run when no other clause's
    /// non-blocking form succeeds immediately. A `Select` with a `default`
    /// clause never suspends the current fiber.
    pub fn default(mut self, handler: impl FnOnce() -> R + 'a) -> Self {
        self.default = Some(Box::new(handler));
        self
    }

    /// Runs the clause scan per §4.H: non-blocking pass in registration
    /// order, then `default` if present, then park on every clause until
    /// exactly one becomes ready.
    pub async fn execute(mut self) -> Result<R> {
        for clause in self.clauses.iter_mut() {
            if let Some(result) = clause.try_immediate() {
                return result;
            }
        }
        if let Some(default) = self.default.take() {
            return Ok(default());
        }
        Parked {
            clauses: self.clauses,
        }
        .await
    }
}

impl<'a, R> Default for Select<'a, R> {
    fn default() -> Self {
        Self::new()
    }
}

struct Parked<'a, R> {
    clauses: Vec<Box<dyn Clause<R> + 'a>>,
}

impl<'a, R> Future for Parked<'a, R> {
    type Output = Result<R>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<R>> {
        let this = self.get_mut();
        let mut winner = None;
        for (index, clause) in this.clauses.iter_mut().enumerate() {
            if let Poll::Ready(result) = clause.poll_parked(cx) {
                winner = Some((index, result));
                break;
            }
        }
        match winner {
            Some((winning_index, result)) => {
                for (index, clause) in this.clauses.iter_mut().enumerate() {
                    if index != winning_index {
                        clause.abandon();
                    }
                }
                Poll::Ready(result)
            }
            None => Poll::Pending,
        }
    }
}

/// Starts building a `select` expression. Equivalent to `Select::new()`.
pub fn select<'a, R>() -> Select<'a, R> {
    Select::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structured::{launch, run_blocking};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn picks_the_only_ready_clause() {
        let result = run_blocking(
            async {
                let a: Channel<i32> = Channel::with_capacity(1);
                let b: Channel<i32> = Channel::with_capacity(1);
                a.try_send(7).unwrap();
                select()
                    .on_receive(&a, |v| format!("a:{v}"))
                    .on_receive(&b, |v| format!("b:{v}"))
                    .execute()
                    .await
            },
            Default::default(),
        );
        assert_eq!(result.unwrap(), "a:7");
    }

    #[test]
    fn registration_order_breaks_ties() {
        let result = run_blocking(
            async {
                let a: Channel<i32> = Channel::with_capacity(1);
                let b: Channel<i32> = Channel::with_capacity(1);
                a.try_send(1).unwrap();
                b.try_send(2).unwrap();
                select()
                    .on_receive(&a, |v| format!("a:{v}"))
                    .on_receive(&b, |v| format!("b:{v}"))
                    .execute()
                    .await
            },
            Default::default(),
        );
        assert_eq!(result.unwrap(), "a:1");
    }

    #[test]
    fn default_runs_when_nothing_is_ready() {
        let result = run_blocking(
            async {
                let a: Channel<i32> = Channel::with_capacity(1);
                select()
                    .on_receive(&a, |v| format!("a:{v}"))
                    .default(|| "default".to_string())
                    .execute()
                    .await
            },
            Default::default(),
        );
        assert_eq!(result.unwrap(), "default");
    }

    #[test]
    fn parks_until_another_fiber_sends() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log2 = log.clone();
        let result = run_blocking(
            async move {
                let a: Channel<&'static str> = Channel::rendezvous();
                let b: Channel<&'static str> = Channel::rendezvous();
                let a2 = a.clone();
                launch(
                    async move {
                        a2.send("from-a").await?;
                        Ok(())
                    },
                    Default::default(),
                );
                let winner = select()
                    .on_receive(&a, |v| v)
                    .on_receive(&b, |v| v)
                    .execute()
                    .await?;
                log2.borrow_mut().push(winner);
                Ok(())
            },
            Default::default(),
        );
        result.unwrap();
        assert_eq!(*log.borrow(), vec!["from-a"]);
    }

    #[test]
    fn losing_clause_requeues_an_already_delivered_value_instead_of_dropping_it() {
        use crate::testing::drain_ticks;

        let mut scheduler = crate::scheduler::Scheduler::new();
        let a: Channel<&'static str> = Channel::rendezvous();
        let b: Channel<&'static str> = Channel::rendezvous();

        let winner = Rc::new(RefCell::new(None));
        let winner2 = winner.clone();
        let (a1, b1) = (a.clone(), b.clone());
        crate::structured::launch(
            async move {
                let result = select()
                    .on_receive(&a1, |v| v)
                    .on_receive(&b1, |v| v)
                    .execute()
                    .await?;
                *winner2.borrow_mut() = Some(result);
                Ok(())
            },
            Default::default(),
        );
        // Parks the select fiber on both channels' recv queues.
        drain_ticks(&mut scheduler);

        // Both sends complete and deliver directly into the parked recv
        // slots before the select fiber gets a chance to run again, so by
        // the time it does, both clauses are already `Delivered`.
        let a2 = a.clone();
        crate::structured::launch(
            async move {
                a2.send("from-a").await?;
                Ok(())
            },
            Default::default(),
        );
        let b2 = b.clone();
        crate::structured::launch(
            async move {
                b2.send("from-b").await?;
                Ok(())
            },
            Default::default(),
        );
        drain_ticks(&mut scheduler);

        assert_eq!(*winner.borrow(), Some("from-a"));
        // The losing clause's already-delivered value must still be
        // observable, not silently dropped.
        assert_eq!(b.try_receive(), Ok("from-b"));
    }
}
