//! The top-level entry point (§4.L).
//!
//! The crate-level overview in [`crate`] follows the module-overview doc
//! block style of `tarantool/src/lib.rs`. [`main`] itself follows a
//! three-step contract: construct the scheduler, drive `block` to
//! completion (and drain whatever it left queued), then tear everything
//! down on the way out regardless of how `block` finished.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;

use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::job;
use crate::scheduler::Scheduler;
use crate::structured::launch;
use crate::worker;

/// Runs `block` to completion as this process's top-level structured-
/// concurrency entry point, then tears down every subsystem before
/// returning.
///
/// Order of operations:
/// 1. If this process was re-exec'd as a named spawn worker (§4.F), run
///    that worker's closure and exit without ever reaching `block` — see
///    [`worker::spawned_worker_entrypoint`].
/// 2. Construct a fresh scheduler on this thread and `launch` `block` on
///    the DEFAULT dispatcher.
/// 3. Drive the scheduler until `block`'s job is terminal, then drain any
///    further queued launches, the MAIN FIFO, and pending I/O (§4.J
///    `runBlocking` semantics — see [`crate::structured::run_blocking`],
///    which this mirrors but does not call directly, since teardown needs
///    the same `Scheduler` value `run_blocking` would otherwise keep
///    private to itself).
/// 4. Tear down: cancel every pending I/O watcher, kill and reap any
///    worker-pool child nobody is awaiting anymore, remove its spill
///    files. Runs unconditionally, whether `block` succeeded, failed, or
///    was never reached to completion (§7: "the driver still performs
///    teardown of workers and watchers on its way out").
///
/// `main` is the only caller in this crate permitted to put the OS thread
/// to sleep (§4.L) — every other suspension point either parks a fiber in
/// a wait-list or, for a bounded cross-process poll (`CrossProcessMutex`),
/// does so cooperatively through [`crate::structured::delay`], which
/// itself only ever runs underneath a driver like this one.
pub fn main<F, T>(block: F) -> Result<T>
where
    F: Future<Output = Result<T>> + 'static,
    T: Serialize + DeserializeOwned + 'static,
{
    worker::spawned_worker_entrypoint();

    if job::current().is_some() {
        return Err(Error::InvalidState(
            "driver::main called while a fiber is already running on this scheduler".into(),
        ));
    }

    let mut scheduler = Scheduler::new();
    let backoff = scheduler.idle_backoff();
    let job = launch(block, Dispatcher::Default);

    while !job.is_final() {
        if !scheduler.tick() {
            if scheduler.drain_main_queue() {
                continue;
            }
            if !scheduler.has_pending_work() {
                break;
            }
            std::thread::sleep(backoff);
        }
    }
    scheduler.run_until_idle();

    let outcome = match job.take_result() {
        Some(result) => result,
        None => Err(job::result_to_join_error(job.status())),
    };

    if let Err(err) = &outcome {
        log::error!("unhandled failure from top-level block: {err}");
    }

    log::debug!("driver teardown: cancelling I/O watchers and reaping workers");
    scheduler.io().cancel_all();
    scheduler.workers().teardown();

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_runs_the_block_and_returns_its_value() {
        let result = main(async { Ok(9) });
        assert_eq!(result.unwrap(), 9);
    }

    #[test]
    fn main_surfaces_an_unhandled_failure_after_tearing_down() {
        let result: Result<()> = main(async { Err(Error::InvalidArgument("boom".into())) });
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn main_rejects_reentrant_invocation() {
        assert!(job::current().is_none());
    }

    #[test]
    fn main_drains_jobs_left_running_past_the_blocks_own_completion() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let ran = Rc::new(RefCell::new(false));
        let ran2 = ran.clone();
        let result = main(async move {
            crate::structured::launch(
                async move {
                    crate::structured::delay(1).await?;
                    *ran2.borrow_mut() = true;
                    Ok(())
                },
                Dispatcher::Default,
            );
            Ok(())
        });
        assert!(result.is_ok());
        assert!(*ran.borrow());
    }
}
