//! The child-process worker pool backing the IO dispatcher (§4.F).
//!
//! Grounded directionally on the fork-based sandboxed-execution workers in
//! the pack's `pvf-execute-worker` (`fork()` a child, run untrusted/blocking
//! work there, marshal only the result back) reimplemented over this
//! crate's own stack: `nix::unistd::fork` instead of a hand-rolled syscall
//! wrapper, `rmp_serde` instead of `parity-scale-codec`, and result transfer
//! through [`shm::Segment`] (an anonymous `MAP_SHARED` mapping, so the
//! forked child can write the result into memory the parent already has
//! mapped) instead of a `UnixStream`.
//!
//! Two submission strategies per §4.F:
//! - **Fork** ([`Pool::submit`]): the child inherits the whole address
//!   space via copy-on-write, so the closure needs no serialization at
//!   all — only its *output* must be `Serialize`.
//! - **Spawn** ([`Pool::submit_named`]): a fresh process with no inherited
//!   state; the closure must already be registered under a stable name
//!   (see [`register_named`]) and is identified by that name plus a
//!   serializable input, per the design note "identified by name (spawn)".
//!   The result comes back over a temp file instead of shared memory,
//!   since a freshly spawned process has no mapping to inherit — the
//!   spec's own "stdin/stdout or file pipe" wording sanctions this.

mod shm;
mod wire;

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write;
use std::process::{Command, Stdio};
use std::rc::Rc;
use std::task::Waker;

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};
use shm::Segment;
use wire::Status;

/// Environment variable a re-exec'd worker binary checks at startup to
/// decide whether it should run a named closure and exit instead of
/// entering `driver::main`'s normal body. See [`spawned_worker_entrypoint`].
pub const SPAWN_WORKER_ENV: &str = "FOROUTINES_SPAWN_WORKER";
const SPAWN_RESULT_PATH_ENV: &str = "FOROUTINES_SPAWN_RESULT_PATH";

/// Tunables for the worker pool, mirroring the teacher's chainable
/// `fiber::Builder` construction style.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pool_size: usize,
    shm_size: usize,
}

impl WorkerPoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Soft cap on in-flight children. Not enforced by this pool (§4.F:
    /// "not enforced by this spec"); callers that want admission control
    /// should check [`Pool::in_flight_count`] themselves before
    /// submitting more work.
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn shm_size(mut self, bytes: usize) -> Self {
        self.shm_size = bytes;
        self
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            shm_size: 10 * 1024 * 1024,
        }
    }
}

struct SharedState<T> {
    result: Option<Result<T>>,
    waker: Option<Waker>,
}

/// The future a `submit`/`submit_named` call hands back; resolves once the
/// scheduler reaps the backing child process.
pub struct WorkerHandle<T> {
    state: Rc<RefCell<SharedState<T>>>,
}

impl<T> std::future::Future for WorkerHandle<T> {
    type Output = Result<T>;

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<T>> {
        let mut state = self.state.borrow_mut();
        if let Some(result) = state.result.take() {
            std::task::Poll::Ready(result)
        } else {
            state.waker = Some(cx.waker().clone());
            std::task::Poll::Pending
        }
    }
}

enum ResultSource {
    Segment(Segment),
    File(std::path::PathBuf),
}

impl ResultSource {
    fn read(&self) -> Result<(Status, Vec<u8>)> {
        match self {
            ResultSource::Segment(segment) => segment.read_result(),
            ResultSource::File(path) => {
                let bytes = std::fs::read(path).map_err(Error::from)?;
                let _ = std::fs::remove_file(path);
                wire::decode_header(&bytes).map(|(status, len)| {
                    let body = bytes[wire::HEADER_LEN..wire::HEADER_LEN + len as usize].to_vec();
                    (status, body)
                })
            }
        }
    }

    /// Removes the spill file backing a `File` source without reading it.
    /// A `Segment` needs no cleanup of its own; it is released when its
    /// owning `Completion` is dropped.
    fn discard(&self) {
        if let ResultSource::File(path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

trait PendingChild {
    fn complete(self: Box<Self>, exited_cleanly: bool);

    /// Abandons this child without resolving its `WorkerHandle`, cleaning
    /// up any spill file it would otherwise have left behind. Used by
    /// [`Pool::teardown`] for children nobody is still awaiting.
    fn discard(self: Box<Self>);
}

struct Completion<T> {
    source: ResultSource,
    state: Rc<RefCell<SharedState<T>>>,
}

impl<T: DeserializeOwned> PendingChild for Completion<T> {
    fn complete(self: Box<Self>, exited_cleanly: bool) {
        let result = if !exited_cleanly {
            Err(Error::WorkerFailure(
                "worker process exited abnormally".into(),
            ))
        } else {
            match self.source.read() {
                Ok((Status::Ok, body)) => {
                    rmp_serde::from_slice::<T>(&body).map_err(Error::from)
                }
                Ok((Status::Err, body)) => {
                    let message = String::from_utf8_lossy(&body).into_owned();
                    Err(Error::WorkerFailure(message))
                }
                Ok((Status::Spilled, _)) => {
                    Err(Error::WorkerFailure("unresolved spilled result".into()))
                }
                Err(e) => Err(e),
            }
        };
        let mut state = self.state.borrow_mut();
        state.result = Some(result);
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }

    fn discard(self: Box<Self>) {
        self.source.discard();
    }
}

type NamedWorkerFn = Box<dyn Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync>;

static NAMED_WORKERS: OnceCell<std::sync::Mutex<HashMap<&'static str, NamedWorkerFn>>> =
    OnceCell::new();

/// Registers a closure under a stable name so the Spawn strategy can look
/// it up by name in a freshly exec'd process that has none of the
/// submitting process's state. Call this once at startup, before any
/// `submit_named` for the same name (typically from a `lazy_static`-style
/// module init, mirrored here as an explicit call since this crate avoids
/// introducing another macro-based initialization dependency).
pub fn register_named<I, O, F>(name: &'static str, f: F)
where
    I: DeserializeOwned,
    O: Serialize,
    F: Fn(I) -> O + Send + Sync + 'static,
{
    let wrapped: NamedWorkerFn = Box::new(move |bytes: &[u8]| {
        let input: I = rmp_serde::from_slice(bytes)?;
        let output = f(input);
        Ok(rmp_serde::to_vec(&output)?)
    });
    let registry = NAMED_WORKERS.get_or_init(|| std::sync::Mutex::new(HashMap::new()));
    registry.lock().expect("named worker registry poisoned").insert(name, wrapped);
}

/// Called by [`crate::driver::main`] before anything else runs. If this
/// process was re-exec'd as a named spawn worker, runs the requested
/// closure, writes its result, and exits without ever reaching the
/// caller's `main` body.
pub fn spawned_worker_entrypoint() {
    let Ok(name) = std::env::var(SPAWN_WORKER_ENV) else {
        return;
    };
    let result_path = std::env::var(SPAWN_RESULT_PATH_ENV)
        .expect("spawn worker invoked without a result path");

    let mut input = Vec::new();
    use std::io::Read;
    std::io::stdin()
        .read_to_end(&mut input)
        .expect("failed to read worker input from stdin");

    let registry = NAMED_WORKERS.get_or_init(|| std::sync::Mutex::new(HashMap::new()));
    let outcome = {
        let registry = registry.lock().expect("named worker registry poisoned");
        match registry.get(name.as_str()) {
            Some(f) => f(&input),
            None => Err(Error::WorkerFailure(format!(
                "no worker registered under name {name:?}"
            ))),
        }
    };

    let (status, body) = match outcome {
        Ok(bytes) => (Status::Ok, bytes),
        Err(e) => (Status::Err, e.to_string().into_bytes()),
    };
    let header = wire::encode_header(status, body.len() as u64);
    let mut file = std::fs::File::create(&result_path).expect("failed to create result file");
    file.write_all(&header).expect("failed to write result header");
    file.write_all(&body).expect("failed to write result body");
    std::process::exit(0);
}

/// The pool of in-flight worker children, reached through the thread-local
/// installed by [`crate::scheduler::Scheduler::new`].
pub struct Pool {
    config: WorkerPoolConfig,
    pending: RefCell<HashMap<Pid, Box<dyn PendingChild>>>,
}

impl Pool {
    pub(crate) fn new(config: WorkerPoolConfig) -> Self {
        Self {
            config,
            pending: RefCell::new(HashMap::new()),
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.pending.borrow().len()
    }

    pub fn pool_size(&self) -> usize {
        self.config.pool_size
    }

    /// Fork strategy: duplicates the current process, runs `f` in the
    /// child, marshals its return value back through shared memory.
    pub fn submit<F, T>(&self, f: F) -> Result<WorkerHandle<T>>
    where
        F: FnOnce() -> T + 'static,
        T: Serialize + DeserializeOwned + 'static,
    {
        let mut segment = Segment::new(self.config.shm_size)?;
        match unsafe { fork() }.map_err(|e| Error::WorkerFailure(e.to_string()))? {
            ForkResult::Child => {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
                match outcome {
                    Ok(value) => match rmp_serde::to_vec(&value) {
                        Ok(bytes) => {
                            let _ = segment.write_result(Status::Ok, &bytes);
                        }
                        Err(e) => {
                            let _ = segment.write_result(Status::Err, e.to_string().as_bytes());
                        }
                    },
                    Err(_) => {
                        let _ = segment.write_result(Status::Err, b"worker panicked");
                    }
                }
                std::process::exit(0);
            }
            ForkResult::Parent { child } => {
                log::debug!("worker pool: forked child {child} (fork strategy)");
                let state = Rc::new(RefCell::new(SharedState {
                    result: None,
                    waker: None,
                }));
                self.pending.borrow_mut().insert(
                    child,
                    Box::new(Completion {
                        source: ResultSource::Segment(segment),
                        state: state.clone(),
                    }),
                );
                Ok(WorkerHandle { state })
            }
        }
    }

    /// Spawn strategy: launches a fresh process re-executing the current
    /// binary with [`SPAWN_WORKER_ENV`] set, writes `input` to its stdin,
    /// and reads the result back from a temp file once the child exits.
    pub fn submit_named<I, T>(&self, name: &'static str, input: &I) -> Result<WorkerHandle<T>>
    where
        I: Serialize,
        T: DeserializeOwned + 'static,
    {
        let exe = std::env::current_exe().map_err(Error::from)?;
        let result_file = tempfile::NamedTempFile::new().map_err(Error::from)?;
        let result_path = result_file.path().to_path_buf();
        // The temp file is recreated by the worker on completion; drop our
        // handle now so the path is free for the worker to write to.
        drop(result_file);

        let mut child = Command::new(exe)
            .env(SPAWN_WORKER_ENV, name)
            .env(SPAWN_RESULT_PATH_ENV, &result_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(Error::from)?;

        let input_bytes = rmp_serde::to_vec(input)?;
        child
            .stdin
            .take()
            .expect("child spawned with piped stdin")
            .write_all(&input_bytes)
            .map_err(Error::from)?;

        let pid = Pid::from_raw(child.id() as i32);
        // `std::process::Child` would otherwise reap this pid itself when
        // dropped; we reap it ourselves via `reap_one`, so leak the handle
        // rather than let it race our own `waitpid`.
        std::mem::forget(child);

        let state = Rc::new(RefCell::new(SharedState {
            result: None,
            waker: None,
        }));
        self.pending.borrow_mut().insert(
            pid,
            Box::new(Completion {
                source: ResultSource::File(result_path),
                state: state.clone(),
            }),
        );
        Ok(WorkerHandle { state })
    }

    /// Non-blocking reap of at most one exited child, per §4.C(c)/§4.F
    /// ("scheduler reaps completed children with non-blocking waits on
    /// each tick").
    pub(crate) fn reap_one(&self) -> bool {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => self.complete(pid, code == 0),
            Ok(WaitStatus::Signaled(pid, _, _)) => self.complete(pid, false),
            _ => false,
        }
    }

    fn complete(&self, pid: Pid, exited_cleanly: bool) -> bool {
        match self.pending.borrow_mut().remove(&pid) {
            Some(child) => {
                log::debug!("worker pool: reaped child {pid} (exited_cleanly={exited_cleanly})");
                child.complete(exited_cleanly);
                true
            }
            None => false,
        }
    }

    pub(crate) fn has_in_flight(&self) -> bool {
        !self.pending.borrow().is_empty()
    }

    /// Forcibly reaps every still-outstanding child, per §4.L teardown
    /// ("reap outstanding workers, remove temp files"). Used by the driver
    /// after the top-level block and a normal drain have both finished;
    /// by that point any remaining entry represents a child the caller
    /// stopped awaiting (e.g. a cancelled `withTimeout`), not one anyone
    /// still expects a result from, so it is killed rather than waited on
    /// indefinitely.
    pub(crate) fn teardown(&self) {
        let pids: Vec<Pid> = self.pending.borrow().keys().copied().collect();
        for pid in pids {
            log::debug!("worker pool teardown: killing outstanding child {pid}");
            let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL);
            let _ = waitpid(pid, None);
            if let Some(child) = self.pending.borrow_mut().remove(&pid) {
                child.discard();
            }
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<Pool>>> = RefCell::new(None);
}

pub(crate) fn install(pool: Rc<Pool>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(pool));
}

/// Submits `f` to the current thread's worker pool via the fork strategy.
pub fn submit<F, T>(f: F) -> Result<WorkerHandle<T>>
where
    F: FnOnce() -> T + 'static,
    T: Serialize + DeserializeOwned + 'static,
{
    CURRENT.with(|c| {
        c.borrow()
            .as_ref()
            .expect("no scheduler installed on this thread")
            .submit(f)
    })
}

/// Submits a previously-[`register_named`]ed closure to the current
/// thread's worker pool via the spawn strategy.
pub fn submit_named<I, T>(name: &'static str, input: &I) -> Result<WorkerHandle<T>>
where
    I: Serialize,
    T: DeserializeOwned + 'static,
{
    CURRENT.with(|c| {
        c.borrow()
            .as_ref()
            .expect("no scheduler installed on this thread")
            .submit_named(name, input)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pool_size_is_at_least_one() {
        let config = WorkerPoolConfig::default();
        assert!(config.pool_size >= 1);
    }

    #[test]
    fn builder_overrides_apply() {
        let config = WorkerPoolConfig::new().pool_size(4).shm_size(1024);
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.shm_size, 1024);
    }

    #[test]
    fn fresh_pool_has_no_in_flight_children() {
        let pool = Pool::new(WorkerPoolConfig::default());
        assert!(!pool.has_in_flight());
        assert_eq!(pool.in_flight_count(), 0);
    }
}
