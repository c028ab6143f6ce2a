//! The fiber primitive.
//!
//! A [`Fiber`] looks stackful to its caller — `launch`/`async` hand it a
//! plain `async` block and the block can `.await` channels, timers, and
//! other fibers just like any other future — but underneath it is a boxed,
//! pinned `Future` driven by repeated `poll` calls from the [`scheduler`].
//! This is the same strategy the fiber-based async executor we grounded
//! this crate on already uses internally: suspension points are just
//! ordinary `Future::poll` returns of `Poll::Pending`, not an actual stack
//! switch.
//!
//! [`scheduler`]: crate::scheduler

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::{Error, Result};

/// What a fiber produced when it last reached a terminal poll.
pub enum FiberOutcome<T> {
    Ready(T),
    Failed(Error),
}

impl<T> fmt::Debug for FiberOutcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberOutcome::Ready(_) => f.write_str("FiberOutcome::Ready(_)"),
            FiberOutcome::Failed(e) => write!(f, "FiberOutcome::Failed({e:?})"),
        }
    }
}

/// Where a fiber is in its lifecycle, mirroring the four states a true
/// stackful coroutine would report: not yet entered, currently polling
/// cooperatively, terminated with a value, or terminated with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    New,
    Started,
    Terminated,
}

/// A boxed, pinned unit of cooperative work.
///
/// `T` is the fiber's return value on success. Errors are represented
/// uniformly as [`Error`] regardless of what the inner future's error type
/// was, since by the time a fiber's failure reaches a [`Job`][crate::job::Job]
/// it has already been converted at the `async`/`launch` boundary.
pub struct Fiber<T> {
    future: Pin<Box<dyn Future<Output = Result<T>>>>,
    state: FiberState,
}

impl<T> Fiber<T> {
    /// Wraps a future as a fiber. The future is not polled until
    /// [`Fiber::resume`] is called for the first time.
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<T>> + 'static,
    {
        Self {
            future: Box::pin(future),
            state: FiberState::New,
        }
    }

    pub fn state(&self) -> FiberState {
        self.state
    }

    pub fn is_started(&self) -> bool {
        self.state != FiberState::New
    }

    pub fn is_terminated(&self) -> bool {
        self.state == FiberState::Terminated
    }

    /// Resumes the fiber, running it until it next suspends or
    /// terminates. Calling this on an already-terminated fiber is a
    /// programmer error: real stackful fibers can't be resumed twice
    /// after returning, and we keep the same contract here rather than
    /// silently handing back a stale result.
    pub fn resume(&mut self, cx: &mut Context<'_>) -> Poll<FiberOutcome<T>> {
        if self.state == FiberState::Terminated {
            return Poll::Ready(FiberOutcome::Failed(Error::InvalidState(
                "resume called on a terminated fiber".into(),
            )));
        }
        self.state = FiberState::Started;
        match self.future.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(value)) => {
                self.state = FiberState::Terminated;
                Poll::Ready(FiberOutcome::Ready(value))
            }
            Poll::Ready(Err(error)) => {
                self.state = FiberState::Terminated;
                Poll::Ready(FiberOutcome::Failed(error))
            }
        }
    }
}

impl<T> fmt::Debug for Fiber<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber").field("state", &self.state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::noop_context;

    #[test]
    fn fresh_fiber_is_new_and_not_terminated() {
        let fiber = Fiber::new(async { Ok::<_, Error>(1) });
        assert_eq!(fiber.state(), FiberState::New);
        assert!(!fiber.is_started());
        assert!(!fiber.is_terminated());
    }

    #[test]
    fn resume_runs_to_completion_for_a_ready_future() {
        let mut fiber = Fiber::new(async { Ok::<_, Error>(42) });
        let mut cx = noop_context();
        match fiber.resume(&mut cx) {
            Poll::Ready(FiberOutcome::Ready(v)) => assert_eq!(v, 42),
            other => panic!("expected Ready(Ready(42)), got {other:?}"),
        }
        assert!(fiber.is_terminated());
    }

    #[test]
    fn resume_propagates_failure() {
        let mut fiber = Fiber::new(async { Err::<i32, _>(Error::Cancelled) });
        let mut cx = noop_context();
        match fiber.resume(&mut cx) {
            Poll::Ready(FiberOutcome::Failed(Error::Cancelled)) => {}
            other => panic!("expected Failed(Cancelled), got {other:?}"),
        }
        assert!(fiber.is_terminated());
    }

    #[test]
    fn resuming_a_terminated_fiber_reports_invalid_state() {
        let mut fiber = Fiber::new(async { Ok::<_, Error>(()) });
        let mut cx = noop_context();
        let _ = fiber.resume(&mut cx);
        match fiber.resume(&mut cx) {
            Poll::Ready(FiberOutcome::Failed(Error::InvalidState(_))) => {}
            other => panic!("expected InvalidState, got {other:?}"),
        }
    }
}
