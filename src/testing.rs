//! Test-only helpers. Not part of the public API.

use std::task::{Context, Waker};

/// A `Context` backed by a waker that does nothing when woken. Good enough
/// for unit tests that drive a future/fiber by hand and don't care about
/// being re-polled automatically.
pub fn noop_context() -> Context<'static> {
    thread_local! {
        static WAKER: Waker = futures::task::noop_waker();
    }
    // `Waker` is `Clone + 'static`, so leaking one per thread is cheap and
    // lets us hand back a `Context<'static>` without unsafe lifetime games.
    let waker: &'static Waker = WAKER.with(|w| {
        let w = w.clone();
        Box::leak(Box::new(w))
    });
    Context::from_waker(waker)
}

/// Runs `scheduler.tick()` until it reports no work was done, returning the
/// number of ticks that did do work. Mirrors the `check_yield`/`csw`
/// pattern of asserting how many context switches a block performed,
/// reimplemented here over our own tick counter instead of a
/// host-reported counter since we have no embedding host to ask.
pub fn drain_ticks(scheduler: &mut crate::scheduler::Scheduler) -> usize {
    let mut did_work_count = 0;
    while scheduler.tick() {
        did_work_count += 1;
    }
    did_work_count
}
