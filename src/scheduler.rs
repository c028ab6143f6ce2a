//! The ready-queue tick loop driving every fiber in a single-threaded
//! runtime.
//!
//! Close cousin of `fiber::future::Executor`: a `VecDeque` of boxed tasks
//! polled round-robin, a task that returns `Pending` goes back to the tail,
//! a task that returns `Ready` is dropped. Where `Executor::do_loop` drains
//! the whole queue in one call, [`Scheduler::tick`] performs exactly one
//! unit of work per call, so a driver loop can interleave timers, I/O and
//! worker reaps against its own tick contract.
//!
//! There is exactly one `Scheduler` per thread, reached through a
//! thread-local rather than passed explicitly through every call in
//! `structured`/`channel`/`flow` — one process-wide instance with explicit
//! init/teardown, made thread-local instead of truly global since nothing
//! in this crate is `Send`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::Context;
use std::time::{Duration, Instant};

use crate::io::Poller;
use crate::timer::TimerQueue;
use crate::waker::RcWake;
use crate::worker::Pool;
use crate::worker::WorkerPoolConfig;

/// Default idle-backoff sleep, matching §4.C ("sleep ~500 μs to avoid busy
/// spin").
pub const DEFAULT_IDLE_BACKOFF: Duration = Duration::from_micros(500);

/// Builder for the handful of knobs a [`Scheduler`] exposes beyond its
/// worker pool (§C): currently just the idle-backoff sleep `tick` falls
/// back to when nothing is ready. Chainable like [`crate::worker::WorkerPoolConfig`].
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    idle_backoff: Duration,
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_backoff: DEFAULT_IDLE_BACKOFF,
        }
    }
}

struct Task {
    future: RefCell<Option<Pin<Box<dyn Future<Output = ()>>>>>,
}

impl RcWake for Task {
    fn wake_by_ref(self: &Rc<Self>) {
        // A task may be woken after it already completed (a lagging
        // waker clone firing late); re-enqueuing a finished task is
        // harmless since its `future` slot is `None` and `tick` simply
        // drops it again.
        enqueue(self.clone());
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<Inner>>> = RefCell::new(None);
}

#[derive(Default)]
struct Inner {
    ready: RefCell<VecDeque<Rc<Task>>>,
    timers: RefCell<TimerQueue>,
    main_queue: RefCell<VecDeque<Box<dyn FnOnce()>>>,
}

fn enqueue(task: Rc<Task>) {
    CURRENT.with(|c| {
        if let Some(inner) = c.borrow().as_ref() {
            inner.ready.borrow_mut().push_back(task);
        }
    });
}

/// Registers `future` to run on the current thread's scheduler. Panics (via
/// a logged `InvalidState`-shaped assumption, surfaced as a no-op) if no
/// scheduler is installed — every public entry point (`launch`, `async`,
/// `runBlocking`) installs one before spawning anything.
pub(crate) fn spawn(future: impl Future<Output = ()> + 'static) {
    let task = Rc::new(Task {
        future: RefCell::new(Some(Box::pin(future))),
    });
    enqueue(task);
}

/// Registers `waker` to fire no earlier than `deadline` against the
/// current thread's timer queue. Used by [`crate::timer`] consumers
/// (`delay`, timeouts, flow backoffs).
pub(crate) fn register_timer(deadline: Instant, waker: std::task::Waker) -> crate::timer::TimerId {
    CURRENT.with(|c| {
        c.borrow()
            .as_ref()
            .expect("no scheduler installed on this thread")
            .timers
            .borrow_mut()
            .register(deadline, waker)
    })
}

pub(crate) fn cancel_timer(id: crate::timer::TimerId) {
    CURRENT.with(|c| {
        if let Some(inner) = c.borrow().as_ref() {
            inner.timers.borrow_mut().cancel(id);
        }
    });
}

/// Queues `f` on the MAIN dispatcher's FIFO, drained by the driver once
/// the DEFAULT ready queue goes idle (§4.K).
pub(crate) fn enqueue_main(f: impl FnOnce() + 'static) {
    CURRENT.with(|c| {
        if let Some(inner) = c.borrow().as_ref() {
            inner.main_queue.borrow_mut().push_back(Box::new(f));
        }
    });
}

/// The single-threaded runtime driving fibers, timers, I/O readiness and
/// worker-pool reaping. Owns the ready queue, timer queue, I/O poller and
/// worker pool; see [`crate::driver::main`] for the top-level loop that
/// ties all four together.
pub struct Scheduler {
    inner: Rc<Inner>,
    io: Rc<Poller>,
    workers: Rc<Pool>,
    idle_backoff: Duration,
}

impl Scheduler {
    /// Builds a scheduler and installs it as this thread's current
    /// scheduler, superseding any previously installed one. There is
    /// deliberately no "uninstall" — a thread either has a scheduler
    /// driving it or doesn't; dropping the `Scheduler` value drops the
    /// ready queue and timers with it, and any task still holding a
    /// cloned `Waker` simply finds `enqueue` is a no-op thereafter.
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default(), WorkerPoolConfig::default())
    }

    pub fn with_worker_pool(config: WorkerPoolConfig) -> Self {
        Self::with_config(SchedulerConfig::default(), config)
    }

    pub fn with_config(config: SchedulerConfig, worker_config: WorkerPoolConfig) -> Self {
        let inner = Rc::new(Inner::default());
        CURRENT.with(|c| *c.borrow_mut() = Some(inner.clone()));

        let io = Rc::new(Poller::new().expect("failed to initialize the async I/O poller"));
        crate::io::install(io.clone());

        let workers = Rc::new(Pool::new(worker_config));
        crate::worker::install(workers.clone());

        log::debug!("scheduler installed (worker pool size {})", workers.pool_size());
        Scheduler {
            inner,
            io,
            workers,
            idle_backoff: config.idle_backoff,
        }
    }

    pub(crate) fn io(&self) -> &Poller {
        &self.io
    }

    pub(crate) fn workers(&self) -> &Pool {
        &self.workers
    }

    pub(crate) fn idle_backoff(&self) -> Duration {
        self.idle_backoff
    }

    fn next_deadline_bound(&self) -> Option<Duration> {
        self.inner.timers.borrow().next_deadline().map(|deadline| {
            deadline.saturating_duration_since(Instant::now())
        })
    }

    /// Performs exactly one unit of work and reports whether it did
    /// anything, per §4.C: fire one due timer, else dispatch one ready I/O
    /// watcher, else reap one completed worker, else resume one runnable
    /// job.
    pub fn tick(&mut self) -> bool {
        let now = Instant::now();
        if let Some(waker) = self.inner.timers.borrow_mut().pop_due(now) {
            waker.wake();
            return true;
        }

        if self.io.dispatch_one() {
            return true;
        }

        if self.workers.reap_one() {
            return true;
        }

        let next = self.inner.ready.borrow_mut().pop_front();
        if let Some(task) = next {
            let mut slot = task.future.borrow_mut();
            if let Some(mut future) = slot.take() {
                drop(slot);
                let waker = task.clone().into_waker();
                let mut cx = Context::from_waker(&waker);
                match future.as_mut().poll(&mut cx) {
                    std::task::Poll::Pending => {
                        *task.future.borrow_mut() = Some(future);
                    }
                    std::task::Poll::Ready(()) => {}
                }
            }
            return true;
        }

        false
    }

    /// Whether calling `tick()` again could plausibly do something:
    /// pending timers, I/O watchers, in-flight workers, runnable jobs, or
    /// closures still waiting on the MAIN FIFO (§4.K).
    pub fn has_pending_work(&self) -> bool {
        !self.inner.ready.borrow().is_empty()
            || !self.inner.timers.borrow().is_empty()
            || !self.inner.main_queue.borrow().is_empty()
            || self.io.has_watchers()
            || self.workers.has_in_flight()
    }

    /// Runs `tick()` until it reports no work, draining the MAIN FIFO
    /// (§4.K) whenever DEFAULT goes idle and looping again in case that
    /// enqueues fresh DEFAULT work, and sleeping for the idle backoff
    /// between rounds as long as pending work remains (§4.C). Returns once
    /// every subsystem — ready queue, timers, I/O, workers, and MAIN — is
    /// quiescent.
    pub fn run_until_idle(&mut self) {
        loop {
            let mut did_work = false;
            while self.tick() {
                did_work = true;
            }
            if self.drain_main_queue() {
                continue;
            }
            if !did_work && !self.has_pending_work() {
                break;
            }
            if !self.has_pending_work() {
                break;
            }
            let backoff = self
                .next_deadline_bound()
                .map(|d| d.min(self.idle_backoff))
                .unwrap_or(self.idle_backoff);
            std::thread::sleep(backoff);
        }
    }

    /// Drains the MAIN dispatcher's deferred FIFO, running each queued
    /// closure in registration order. Called by the driver after DEFAULT
    /// is idle (§4.K).
    pub(crate) fn drain_main_queue(&self) -> bool {
        let mut ran_any = false;
        loop {
            let next = self.inner.main_queue.borrow_mut().pop_front();
            match next {
                Some(f) => {
                    f();
                    ran_any = true;
                }
                None => break,
            }
        }
        ran_any
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn tick_runs_a_spawned_task_to_completion() {
        let mut scheduler = Scheduler::new();
        let ran = Rc::new(Cell::new(false));
        let ran2 = ran.clone();
        spawn(async move {
            ran2.set(true);
        });
        let did_work = crate::testing::drain_ticks(&mut scheduler);
        assert!(did_work > 0);
        assert!(ran.get());
    }

    #[test]
    fn tick_reports_no_work_on_an_empty_scheduler() {
        let mut scheduler = Scheduler::new();
        assert!(!scheduler.tick());
    }

    #[test]
    fn timers_fire_before_io_or_ready_jobs() {
        let mut scheduler = Scheduler::new();
        let fired = Rc::new(Cell::new(false));
        let fired2 = fired.clone();
        spawn(async move {
            crate::timer::await_deadline(Instant::now()).await.unwrap();
            fired2.set(true);
        });
        crate::testing::drain_ticks(&mut scheduler);
        assert!(fired.get());
    }

    #[test]
    fn scheduler_config_idle_backoff_overrides_the_default() {
        let config = SchedulerConfig::new().idle_backoff(Duration::from_micros(42));
        let scheduler = Scheduler::with_config(config, WorkerPoolConfig::default());
        assert_eq!(scheduler.idle_backoff(), Duration::from_micros(42));
    }

    #[test]
    fn main_queue_drains_in_registration_order() {
        let scheduler = Scheduler::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            enqueue_main(move || order.borrow_mut().push(i));
        }
        scheduler.drain_main_queue();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }
}
