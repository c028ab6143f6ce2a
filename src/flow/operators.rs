//! The `Collector` wrappers backing `Flow`'s operator chain.
//!
//! Each operator composes by wrapping the *downstream* collector a
//! producer emits into, the same shape `fiber::channel`'s send/receive
//! pairing uses for a single hop, generalized here into a chain of hops.
//! `take`'s short-circuit and `catch`'s "upstream only" scoping are the
//! two wrappers that need a side channel beyond "transform and forward";
//! see the comments on each for why.

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::rc::Rc;

use super::{BoxFuture, Collector};
use crate::error::{Error, Result};

pub(super) struct MapCollector<T, U, F> {
    pub(super) downstream: Box<dyn Collector<U>>,
    pub(super) f: Rc<F>,
    pub(super) _marker: PhantomData<fn(T)>,
}

impl<T, U, F> Collector<T> for MapCollector<T, U, F>
where
    F: Fn(T) -> U,
{
    fn emit<'a>(&'a mut self, value: T) -> BoxFuture<'a, Result<()>> {
        let mapped = (self.f)(value);
        self.downstream.emit(mapped)
    }
}

pub(super) struct FilterCollector<T, F> {
    pub(super) downstream: Box<dyn Collector<T>>,
    pub(super) predicate: Rc<F>,
}

impl<T, F> Collector<T> for FilterCollector<T, F>
where
    F: Fn(&T) -> bool,
{
    fn emit<'a>(&'a mut self, value: T) -> BoxFuture<'a, Result<()>> {
        if (self.predicate)(&value) {
            self.downstream.emit(value)
        } else {
            Box::pin(async { Ok(()) })
        }
    }
}

/// `take(n)`'s downstream-facing collector. Forwards the first `n` values,
/// then flips `stopped` and raises `Error::Cancelled` as the "well-defined
/// cancellation signal" the producer's own `emit(...).await?` naturally
/// unwinds on (§9 design note). [`super::Flow::take`]'s wrapper checks
/// `stopped` to tell this short-circuit apart from a real upstream
/// cancellation before deciding whether to swallow the error.
pub(super) struct TakeCollector<T> {
    pub(super) downstream: Box<dyn Collector<T>>,
    pub(super) remaining: Cell<usize>,
    pub(super) stopped: Rc<Cell<bool>>,
}

impl<T: 'static> Collector<T> for TakeCollector<T> {
    fn emit<'a>(&'a mut self, value: T) -> BoxFuture<'a, Result<()>> {
        if self.stopped.get() {
            return Box::pin(async { Err(Error::Cancelled) });
        }
        let remaining = self.remaining.get();
        if remaining == 0 {
            self.stopped.set(true);
            return Box::pin(async { Err(Error::Cancelled) });
        }
        self.remaining.set(remaining - 1);
        if remaining == 1 {
            self.stopped.set(true);
        }
        self.downstream.emit(value)
    }
}

/// Wraps the collector passed to an upstream `run` so `catch` can tell a
/// downstream failure (thrown from inside `collector.emit`, i.e. by a
/// later operator or the terminal consumer) apart from an error the
/// upstream producer raised itself. `catch` only handles the latter
/// (§4.I: "handles errors raised upstream of it, not downstream").
pub(super) struct DownstreamMarking<T> {
    pub(super) inner: Box<dyn Collector<T>>,
    pub(super) marked: Rc<Cell<bool>>,
}

impl<T: 'static> Collector<T> for DownstreamMarking<T> {
    fn emit<'a>(&'a mut self, value: T) -> BoxFuture<'a, Result<()>> {
        let marked = self.marked.clone();
        let fut = self.inner.emit(value);
        Box::pin(async move {
            let result = fut.await;
            if result.is_err() {
                marked.set(true);
            }
            result
        })
    }
}

/// `skip(n)`'s downstream-facing collector: drops the first `n` values,
/// then forwards everything after unchanged.
pub(super) struct SkipCollector<T> {
    pub(super) downstream: Box<dyn Collector<T>>,
    pub(super) remaining: Cell<usize>,
}

impl<T: 'static> Collector<T> for SkipCollector<T> {
    fn emit<'a>(&'a mut self, value: T) -> BoxFuture<'a, Result<()>> {
        let remaining = self.remaining.get();
        if remaining > 0 {
            self.remaining.set(remaining - 1);
            return Box::pin(async { Ok(()) });
        }
        self.downstream.emit(value)
    }
}

/// `on_each(f)`'s collector: runs `f` as a side effect on every value that
/// reaches this point in the chain, then forwards the value unchanged.
pub(super) struct OnEachCollector<T, F> {
    pub(super) downstream: Box<dyn Collector<T>>,
    pub(super) f: Rc<F>,
}

impl<T, F> Collector<T> for OnEachCollector<T, F>
where
    F: Fn(&T),
{
    fn emit<'a>(&'a mut self, value: T) -> BoxFuture<'a, Result<()>> {
        (self.f)(&value);
        self.downstream.emit(value)
    }
}

/// `flat_map(f)`'s collector: for each upstream value, collects the inner
/// flow `f` produces, forwarding each of its values downstream in turn
/// before moving on to the next upstream value (sequential, not
/// interleaved — matches collection running synchronously to the current
/// fiber per §4.I).
pub(super) struct FlatMapCollector<T, U, F> {
    pub(super) downstream: Rc<RefCell<Box<dyn Collector<U>>>>,
    pub(super) f: Rc<F>,
    pub(super) _marker: PhantomData<fn(T)>,
}

impl<T, U, F, Fut> Collector<T> for FlatMapCollector<T, U, F>
where
    U: 'static,
    F: Fn(T) -> Fut,
    Fut: std::future::Future<Output = super::Flow<U>> + 'static,
{
    fn emit<'a>(&'a mut self, value: T) -> BoxFuture<'a, Result<()>> {
        let f = self.f.clone();
        let downstream = self.downstream.clone();
        Box::pin(async move {
            let inner_flow = f(value).await;
            inner_flow
                .run(Box::new(ForwardingCollector { downstream }))
                .await
        })
    }
}

struct ForwardingCollector<U> {
    downstream: Rc<RefCell<Box<dyn Collector<U>>>>,
}

impl<U: 'static> Collector<U> for ForwardingCollector<U> {
    fn emit<'a>(&'a mut self, value: U) -> BoxFuture<'a, Result<()>> {
        let downstream = self.downstream.clone();
        Box::pin(async move { downstream.borrow_mut().emit(value).await })
    }
}

pub(super) struct DistinctCollector<T> {
    pub(super) downstream: Box<dyn Collector<T>>,
    pub(super) last: RefCell<Option<T>>,
}

impl<T: Clone + PartialEq + 'static> Collector<T> for DistinctCollector<T> {
    fn emit<'a>(&'a mut self, value: T) -> BoxFuture<'a, Result<()>> {
        let unchanged = self.last.borrow().as_ref() == Some(&value);
        if unchanged {
            Box::pin(async { Ok(()) })
        } else {
            *self.last.borrow_mut() = Some(value.clone());
            self.downstream.emit(value)
        }
    }
}
