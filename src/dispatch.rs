//! The `Dispatcher` enum and its routing (§4.K).
//!
//! Generalizes the "three execution strategies" distinction already latent
//! in `fiber::Cond`/`fiber::Builder` (local fiber) vs. the separate
//! `r#async::coio`/Tarantool "background worker" naming for anything that
//! leaves the current fiber's stack into an explicit enum consumed by
//! [`crate::structured::launch`]/`spawn_async`, instead of leaving the
//! choice implicit in which module a caller reaches for.

/// Where a job created by `launch`/`async` should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatcher {
    /// Runs as an ordinary fiber on this thread's scheduler (§4.C).
    Default,
    /// Submitted to the worker pool (§4.F); the job's result resolves once
    /// the scheduler reaps the backing child process.
    Io,
    /// Deferred onto the MAIN FIFO, drained once the DEFAULT ready queue is
    /// idle (§4.K).
    Main,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Dispatcher::Default
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_dispatcher_is_default_variant() {
        assert_eq!(Dispatcher::default(), Dispatcher::Default);
    }
}
