//! Job lifecycle: the state machine wrapped around a fiber's future.
//!
//! A `Job` is the handle structured concurrency hands back from `launch`
//! and that `Deferred` (in [`structured`][crate::structured]) builds on top
//! of for `async`. Its status only ever advances towards a terminal state;
//! once terminal, `endTime` is fixed and every registered completion
//! invoker fires exactly once, in registration order, before `join`
//! returns to its own waiters.
//!
//! Cancellation is advisory, the same way `fiber::cancel()` /
//! `fiber::is_cancelled()` work: `cancel()` flips a flag and wakes
//! whatever the job is currently suspended on, but it is up to every
//! suspension point in this crate (delay, channel send/receive, select,
//! flow collection, mutex acquire, join) to notice the flag and unwind.
//! [`CancelToken`] is that flag plus the single waker a job is currently
//! parked on; [`current`] exposes the innermost running job to whatever
//! suspension-point future polls next, the way a thread-local "current
//! fiber" would.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::Instant;

use crate::error::{Error, Result};
use crate::util::IdGenerator;

/// Where a job is in its lifecycle. Transitions only ever move down this
/// list; `Completed`, `Failed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    New,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Cancelled)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::New => "new",
            Status::Running => "running",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

static JOB_IDS: IdGenerator = IdGenerator::new();

/// Allocates the next globally unique job id.
pub(crate) fn next_id() -> u64 {
    JOB_IDS.next()
}

/// The cancellation flag plus the single waker a suspension point last
/// registered, shared between a `Job` and every future it is currently
/// awaiting. Mirrors the `fiber::cancel()`/`is_cancelled()` pair:
/// cancellation is advisory (a flag checked by cooperating code), and
/// `cancel()` additionally fires an "asynchronous wakeup event" (here, the
/// registered `Waker`) so a parked suspension notices it promptly instead
/// of waiting for an unrelated event.
#[derive(Debug, Default)]
pub(crate) struct CancelToken {
    cancelled: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }

    /// Registers the waker that should be woken if this token is cancelled
    /// while parked. Overwrites any previously registered waker, same as
    /// every other suspension point in this crate (only the latest
    /// registration matters, mirroring `fiber_is_cancelled`'s "checked
    /// whenever a wakeup event occurs").
    pub fn register(&self, waker: &Waker) {
        *self.waker.borrow_mut() = Some(waker.clone());
    }

    pub fn cancel(&self) {
        self.cancelled.set(true);
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
    }
}

/// Type-erased view of a `Job<T>` for any `T`, used for the parent→children
/// strong-reference fan-out structured concurrency needs. Children are
/// tracked regardless of their return type, so this crosses the `T`
/// boundary the same way `Job<()>` parenting did before multiple return
/// types needed to nest.
pub(crate) trait ErasedJob {
    fn job_id(&self) -> u64;
    fn job_status(&self) -> Status;
    fn job_cancel(&self);
    fn cancel_token(&self) -> &Rc<CancelToken>;
    fn add_child(&self, child: Rc<dyn ErasedJob>);
}

thread_local! {
    static CURRENT: RefCell<Vec<Rc<dyn ErasedJob>>> = RefCell::new(Vec::new());
}

/// Pushes `job` as the innermost currently-running job. Paired with [`pop`];
/// callers should use a guard (see `structured::JobScope`) rather than call
/// these directly to stay panic-safe.
pub(crate) fn push_current(job: Rc<dyn ErasedJob>) {
    CURRENT.with(|c| c.borrow_mut().push(job));
}

pub(crate) fn pop_current() {
    CURRENT.with(|c| {
        c.borrow_mut().pop();
    });
}

/// The job whose fiber body is currently being polled, if any. `None` at
/// the top level of `runBlocking`/`main`, which are not themselves
/// cancellable jobs.
pub(crate) fn current() -> Option<Rc<dyn ErasedJob>> {
    CURRENT.with(|c| c.borrow().last().cloned())
}

struct Inner<T> {
    id: u64,
    status: Cell<Status>,
    start_time: Instant,
    end_time: Cell<Option<Instant>>,
    deadline: Cell<Option<Instant>>,
    result: RefCell<Option<Result<T>>>,
    join_wakers: RefCell<Vec<Waker>>,
    completion_invokers: RefCell<Vec<Box<dyn FnOnce(Status)>>>,
    parent_id: Option<u64>,
    cancel: Rc<CancelToken>,
    children: RefCell<Vec<Rc<dyn ErasedJob>>>,
}

/// A handle to a running or finished unit of structured work.
///
/// Cloning a `Job` shares the same underlying state: every clone observes
/// the same status, and `join`/`cancel`/`invokeOnCompletion` called on any
/// clone affect all of them.
pub struct Job<T = ()> {
    inner: Rc<Inner<T>>,
}

impl<T> Clone for Job<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Job<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.inner.id)
            .field("status", &self.inner.status.get())
            .finish()
    }
}

impl<T: 'static> Job<T> {
    /// Creates a new job. If `parent` is given, this job is registered as
    /// one of its children so that cancelling the parent cascades here
    /// too (structured concurrency, §5 "Cancellation semantics").
    pub(crate) fn new(parent: Option<&Rc<dyn ErasedJob>>) -> Self {
        let job = Self {
            inner: Rc::new(Inner {
                id: next_id(),
                status: Cell::new(Status::New),
                start_time: Instant::now(),
                end_time: Cell::new(None),
                deadline: Cell::new(None),
                result: RefCell::new(None),
                join_wakers: RefCell::new(Vec::new()),
                completion_invokers: RefCell::new(Vec::new()),
                parent_id: parent.map(|p| p.job_id()),
                cancel: Rc::new(CancelToken::default()),
                children: RefCell::new(Vec::new()),
            }),
        };
        if let Some(parent) = parent {
            parent.add_child(job.erased());
        }
        job
    }

    /// Erases this job's return type, keeping only the lifecycle surface
    /// that structured concurrency's parent/child bookkeeping needs.
    pub(crate) fn erased(&self) -> Rc<dyn ErasedJob> {
        self.inner.clone()
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn status(&self) -> Status {
        self.inner.status.get()
    }

    pub fn is_completed(&self) -> bool {
        self.status() == Status::Completed
    }

    pub fn is_cancelled(&self) -> bool {
        self.status() == Status::Cancelled
    }

    pub fn is_final(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn start_time(&self) -> Instant {
        self.inner.start_time
    }

    pub fn end_time(&self) -> Option<Instant> {
        self.inner.end_time.get()
    }

    pub fn parent_id(&self) -> Option<u64> {
        self.inner.parent_id
    }

    /// Records a deadline; the scheduler's timeout machinery consults this
    /// to cancel the job once it elapses. Does not by itself suspend
    /// anything — see [`crate::structured::with_timeout`].
    pub(crate) fn set_deadline(&self, deadline: Instant) {
        self.inner.deadline.set(Some(deadline));
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline.get()
    }

    pub(crate) fn cancel_token(&self) -> &Rc<CancelToken> {
        &self.inner.cancel
    }

    /// Requests cancellation, cascading to every child registered via
    /// `launch`/`async` called from within this job's body. Jobs that are
    /// still `New` are marked cancelled immediately and are never entered.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
        if self.status() == Status::New {
            self.finish(Status::Cancelled, None);
        }
        for child in self.inner.children.borrow().iter() {
            child.job_cancel();
        }
    }

    pub(crate) fn mark_running(&self) {
        if self.status() == Status::New {
            self.inner.status.set(Status::Running);
        }
    }

    /// Moves the job to a terminal status, records its result (if any),
    /// wakes every parked `join`er, and fires every completion invoker in
    /// registration order. Calling this twice on the same job is a no-op
    /// after the first call, matching "once terminal, endTime is set
    /// exactly once".
    pub(crate) fn finish(&self, status: Status, result: Option<Result<T>>) {
        if self.status().is_terminal() {
            return;
        }
        debug_assert!(status.is_terminal());
        log::trace!("job {} terminal: {status}", self.inner.id);
        self.inner.status.set(status);
        self.inner.end_time.set(Some(Instant::now()));
        if let Some(result) = result {
            *self.inner.result.borrow_mut() = Some(result);
        }
        for waker in self.inner.join_wakers.borrow_mut().drain(..) {
            waker.wake();
        }
        for invoker in self.inner.completion_invokers.borrow_mut().drain(..) {
            invoker(status);
        }
    }

    /// Registers a callback to run once the job reaches a terminal state.
    /// If it already has, the callback runs immediately (still honoring
    /// registration order relative to callbacks registered earlier and not
    /// yet run, since those were drained by an earlier `finish`).
    pub fn invoke_on_completion(&self, callback: impl FnOnce(Status) + 'static) {
        if self.status().is_terminal() {
            callback(self.status());
        } else {
            self.inner
                .completion_invokers
                .borrow_mut()
                .push(Box::new(callback));
        }
    }

    /// Parks `waker` to be notified when the job becomes terminal. Used by
    /// `join`'s `Future` impl; does nothing (and fires the waker
    /// immediately) if the job is already terminal.
    pub(crate) fn register_join_waker(&self, waker: Waker) {
        if self.status().is_terminal() {
            waker.wake();
        } else {
            self.inner.join_wakers.borrow_mut().push(waker);
        }
    }

    pub(crate) fn take_result(&self) -> Option<Result<T>> {
        self.inner.result.borrow_mut().take()
    }

    /// Suspends the caller until this job reaches a terminal state,
    /// resolving to its recorded result or to the appropriate error if it
    /// was cancelled or failed without one (§4.B `join()`).
    pub fn join(&self) -> Join<'_, T> {
        Join { job: self }
    }
}

/// The future returned by [`Job::join`].
pub struct Join<'a, T> {
    job: &'a Job<T>,
}

impl<'a, T: 'static> Future for Join<'a, T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<T>> {
        if let Some(err) = check_cancelled(cx.waker()) {
            return Poll::Ready(Err(err));
        }
        if self.job.is_final() {
            return Poll::Ready(match self.job.take_result() {
                Some(result) => result,
                None => Err(result_to_join_error(self.job.status())),
            });
        }
        self.job.register_join_waker(cx.waker().clone());
        Poll::Pending
    }
}

impl<T: 'static> ErasedJob for Inner<T> {
    fn job_id(&self) -> u64 {
        self.id
    }

    fn job_status(&self) -> Status {
        self.status.get()
    }

    fn job_cancel(&self) {
        self.cancel.cancel();
        if self.status.get() == Status::New {
            self.status.set(Status::Cancelled);
            self.end_time.set(Some(Instant::now()));
            for waker in self.join_wakers.borrow_mut().drain(..) {
                waker.wake();
            }
            for invoker in self.completion_invokers.borrow_mut().drain(..) {
                invoker(Status::Cancelled);
            }
        }
        for child in self.children.borrow().iter() {
            child.job_cancel();
        }
    }

    fn cancel_token(&self) -> &Rc<CancelToken> {
        &self.cancel
    }

    fn add_child(&self, child: Rc<dyn ErasedJob>) {
        self.children.borrow_mut().push(child);
    }
}

/// Registers `waker` against the innermost running job's cancel token and
/// reports whether that job has already been cancelled. Every suspension
/// point in this crate (channel send/receive, select, flow collection,
/// mutex acquire) calls this each time it parks, so a `cancel()` issued
/// while parked is noticed on the next poll instead of only at the next
/// unrelated wakeup. Returns `None` when there is no current job (e.g.
/// inside `runBlocking`'s own body) — nothing to cancel against.
pub(crate) fn check_cancelled(waker: &std::task::Waker) -> Option<Error> {
    let job = current()?;
    let token = job.cancel_token();
    token.register(waker);
    if token.is_cancelled() {
        Some(Error::Cancelled)
    } else {
        None
    }
}

/// Errors specific to joining/awaiting a job that never produced a usable
/// result, e.g. because it was cancelled.
pub fn result_to_join_error(status: Status) -> Error {
    match status {
        Status::Cancelled => Error::Cancelled,
        Status::Failed => Error::InvalidState("job failed without a recorded error".into()),
        _ => Error::InvalidState(format!("job in non-terminal status {status}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_starts_in_new_status() {
        let job = Job::<()>::new(None);
        assert_eq!(job.status(), Status::New);
        assert!(!job.is_final());
    }

    #[test]
    fn finish_is_idempotent_and_fixes_end_time() {
        let job = Job::<i32>::new(None);
        job.mark_running();
        job.finish(Status::Completed, Some(Ok(7)));
        let first_end = job.end_time();
        job.finish(Status::Failed, Some(Err(Error::Cancelled)));
        assert_eq!(job.status(), Status::Completed);
        assert_eq!(job.end_time(), first_end);
        assert_eq!(job.take_result().unwrap().unwrap(), 7);
    }

    #[test]
    fn cancel_before_start_finishes_immediately_without_running() {
        let job = Job::<()>::new(None);
        job.cancel();
        assert_eq!(job.status(), Status::Cancelled);
    }

    #[test]
    fn completion_invokers_fire_once_in_registration_order() {
        let job = Job::<()>::new(None);
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            job.invoke_on_completion(move |_| order.borrow_mut().push(i));
        }
        job.finish(Status::Completed, Some(Ok(())));
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn invoke_on_completion_after_terminal_runs_immediately() {
        let job = Job::<()>::new(None);
        job.finish(Status::Completed, Some(Ok(())));
        let ran = Rc::new(Cell::new(false));
        let ran2 = ran.clone();
        job.invoke_on_completion(move |_| ran2.set(true));
        assert!(ran.get());
    }

    #[test]
    fn cancelling_parent_cascades_to_children() {
        let parent = Job::<()>::new(None);
        let erased_parent = parent.erased();
        let child_a = Job::<()>::new(Some(&erased_parent));
        let child_b = Job::<i32>::new(Some(&erased_parent));
        parent.cancel();
        assert!(parent.is_cancelled());
        assert_eq!(child_a.status(), Status::Cancelled);
        assert_eq!(child_b.status(), Status::Cancelled);
    }

    #[test]
    fn cancelling_parent_does_not_affect_already_completed_child() {
        let parent = Job::<()>::new(None);
        let erased_parent = parent.erased();
        let completed_child = Job::<()>::new(Some(&erased_parent));
        completed_child.finish(Status::Completed, Some(Ok(())));
        parent.cancel();
        assert_eq!(completed_child.status(), Status::Completed);
    }

    #[test]
    fn join_resolves_once_finished() {
        use crate::testing::noop_context;
        use std::future::Future;
        use std::pin::Pin;

        let job = Job::<i32>::new(None);
        let mut join = job.join();
        let mut cx = noop_context();
        assert!(Future::poll(Pin::new(&mut join), &mut cx).is_pending());
        job.finish(Status::Completed, Some(Ok(99)));
        match Future::poll(Pin::new(&mut join), &mut cx) {
            Poll::Ready(Ok(99)) => {}
            other => panic!("expected Ready(Ok(99)), got {other:?}"),
        }
    }

    #[test]
    fn current_job_stack_pushes_and_pops() {
        assert!(current().is_none());
        let job = Job::<()>::new(None);
        push_current(job.erased());
        assert_eq!(current().unwrap().job_id(), job.id());
        pop_current();
        assert!(current().is_none());
    }
}
