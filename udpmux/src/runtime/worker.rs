//! Managed background worker thread.
//!
//! A [`ManagedWorker`] owns at most one OS thread at a time and drives a
//! caller-supplied step function on it. Start and stop are idempotent and may
//! be called from any number of threads concurrently; the outcome of every
//! race is settled by compare-and-swap on a single state word:
//!
//! ```text
//!   Down ──start()──> Init ──thread up──> Work ──stop()/Finished──> Stop ──thread exit──> Down
//! ```
//!
//! Timeouts passed to [`start`](ManagedWorker::start) and
//! [`stop`](ManagedWorker::stop) only bound how long the *caller* waits for
//! the state to settle. A timed-out start or stop keeps running to completion.

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crate::Outcome;
use crate::fatal::fail_fast;
use crate::sync::Timeout;
use crate::sync::queue::expired;
use crate::trace::{debug, error, info, warn};

/// Lifecycle state of a [`ManagedWorker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// No thread is alive.
    Down = 0,
    /// A start was accepted; the thread is being spawned.
    Init = 1,
    /// The thread is running steps.
    Work = 2,
    /// A stop was requested; the thread exits after its current step.
    Stop = 3,
}

impl WorkerState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Down,
            1 => Self::Init,
            2 => Self::Work,
            3 => Self::Stop,
            _ => fail_fast("corrupted worker state word"),
        }
    }
}

/// What the step function asks the worker to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Invoke the step again (unless a stop was requested meanwhile).
    Continue,
    /// Stop the worker; no external [`ManagedWorker::stop`] is needed.
    Finished,
}

/// Configuration for the worker thread.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// OS thread name.
    pub name: String,
    /// Pin the thread to this core id before running steps.
    pub core: Option<usize>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "udpmux-worker".into(),
            core: None,
        }
    }
}

/// Error from a worker lifecycle operation.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The state did not settle within the caller's timeout.
    #[error("timed out waiting for the worker to settle")]
    Timeout,
    /// The OS refused to create the thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
}

/// State word on its own cache line, away from the step closure.
#[repr(C)]
#[repr(align(64))]
struct StateWord(AtomicU8);

type StepFn = dyn Fn() -> Step + Send + Sync;

struct Shared {
    state: StateWord,
    step: Box<StepFn>,
}

impl Shared {
    #[inline]
    fn load(&self) -> WorkerState {
        WorkerState::from_raw(self.state.0.load(Ordering::Acquire))
    }

    #[inline]
    fn store(&self, state: WorkerState) {
        self.state.0.store(state as u8, Ordering::Release);
    }

    /// CAS `from -> to`. On failure returns the state actually observed.
    #[inline]
    fn transition(&self, from: WorkerState, to: WorkerState) -> Result<(), WorkerState> {
        self.state
            .0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(WorkerState::from_raw)
    }

    /// Yields while the state equals `state`.
    ///
    /// Returns `false` if the deadline passed first.
    fn wait_while(&self, state: WorkerState, deadline: Option<minstant::Instant>) -> bool {
        loop {
            if self.load() != state {
                return true;
            }
            if expired(deadline) {
                return false;
            }
            thread::yield_now();
        }
    }
}

/// Stores `Down` when the worker thread leaves its loop, including by panic.
struct DownOnExit<'a>(&'a Shared);

impl Drop for DownOnExit<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("step function panicked, worker going down");
        }
        self.0.store(WorkerState::Down);
    }
}

/// Owner of a single background thread running a step function in a loop.
pub struct ManagedWorker {
    shared: Arc<Shared>,
    config: WorkerConfig,
    /// Handles of spawned threads; finished ones are joined on the next start.
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ManagedWorker {
    /// Creates a stopped worker that will run `step` once started.
    pub fn new<F>(config: WorkerConfig, step: F) -> Self
    where
        F: Fn() -> Step + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                state: StateWord(AtomicU8::new(WorkerState::Down as u8)),
                step: Box::new(step),
            }),
            config,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Starts the worker thread.
    ///
    /// Exactly one of any number of concurrent callers spawns the thread and
    /// gets [`Outcome::Done`]; the others get [`Outcome::Already`].
    ///
    /// # Errors
    ///
    /// - [`WorkerError::Timeout`] if the thread did not come up in time (it may
    ///   still finish starting afterwards)
    /// - [`WorkerError::Spawn`] if the thread could not be created; the worker
    ///   is left `Down`
    pub fn start(&self, timeout: Timeout) -> Result<Outcome, WorkerError> {
        let deadline = timeout.deadline();
        if self
            .shared
            .transition(WorkerState::Down, WorkerState::Init)
            .is_err()
        {
            return Ok(Outcome::Already);
        }

        let shared = Arc::clone(&self.shared);
        let core = self.config.core;

        debug!(name = %self.config.name, "spawning worker thread");
        let spawned = thread::Builder::new()
            .name(self.config.name.clone())
            .spawn(move || run(&shared, core));

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                error!(name = %self.config.name, error = %e, "failed to spawn worker thread");
                self.shared.store(WorkerState::Down);
                return Err(WorkerError::Spawn(e));
            }
        };

        self.track(handle);

        if self.shared.wait_while(WorkerState::Init, deadline) {
            Ok(Outcome::Done)
        } else {
            warn!(name = %self.config.name, "worker start timed out");
            Err(WorkerError::Timeout)
        }
    }

    /// Stops the worker thread.
    ///
    /// Handles every interleaving with concurrent callers:
    /// 1. a start still in flight is waited for (same timeout), then stopped;
    /// 2. `Work` is switched to `Stop` and the caller waits for `Down`;
    /// 3. a stop already scheduled by someone else is waited for, then
    ///    reported as [`Outcome::Already`];
    /// 4. an already stopped worker reports [`Outcome::Already`].
    ///
    /// # Errors
    ///
    /// [`WorkerError::Timeout`] if the state did not settle in time. The stop
    /// still completes in the background.
    pub fn stop(&self, timeout: Timeout) -> Result<Outcome, WorkerError> {
        let deadline = timeout.deadline();

        if self.shared.load() == WorkerState::Init
            && !self.shared.wait_while(WorkerState::Init, deadline)
        {
            return Err(WorkerError::Timeout);
        }

        match self.shared.transition(WorkerState::Work, WorkerState::Stop) {
            Ok(()) => {
                debug!(name = %self.config.name, "stop scheduled");
                if self.shared.wait_while(WorkerState::Stop, deadline) {
                    Ok(Outcome::Done)
                } else {
                    Err(WorkerError::Timeout)
                }
            }
            Err(WorkerState::Down) => Ok(Outcome::Already),
            Err(WorkerState::Stop) => {
                if self.shared.wait_while(WorkerState::Stop, deadline) {
                    Ok(Outcome::Already)
                } else {
                    Err(WorkerError::Timeout)
                }
            }
            // Another caller stopped and restarted the worker since our check;
            // that start owns the thread now.
            Err(WorkerState::Init) => Ok(Outcome::Already),
            Err(WorkerState::Work) => fail_fast("worker CAS failed while observing Work"),
        }
    }

    /// Records a freshly spawned thread and joins the ones that have exited.
    fn track(&self, spawned: JoinHandle<()>) {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        let (finished, live): (Vec<_>, Vec<_>) =
            handles.drain(..).partition(JoinHandle::is_finished);
        for handle in finished {
            let _ = handle.join();
        }
        *handles = live;
        handles.push(spawned);
    }

    /// `true` unless the worker is `Down`.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.load() != WorkerState::Down
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        self.shared.load()
    }
}

impl Drop for ManagedWorker {
    fn drop(&mut self) {
        if self.is_running() {
            warn!(name = %self.config.name, "dropping an active worker, forcing stop");
            if let Err(_e) = self.stop(Timeout::Infinite) {
                error!(name = %self.config.name, error = %_e, "failed to stop worker on drop");
            }
        }

        let handles = self.handles.get_mut().unwrap_or_else(PoisonError::into_inner);
        for handle in handles.drain(..) {
            if handle.join().is_err() {
                error!(name = %self.config.name, "worker thread panicked");
            }
        }
    }
}

/// Body of the worker thread.
fn run(shared: &Shared, core: Option<usize>) {
    if let Some(id) = core
        && !core_affinity::set_for_current(core_affinity::CoreId { id })
    {
        warn!(core = id, "failed to pin worker thread");
    }

    let _down = DownOnExit(shared);
    shared.store(WorkerState::Work);
    info!("worker started");

    while shared.load() != WorkerState::Stop {
        if (shared.step)() == Step::Finished {
            // An external stop may have raced us here; either way we are stopping.
            let _ = shared.transition(WorkerState::Work, WorkerState::Stop);
            debug!("step reported completion");
            break;
        }
    }

    info!("worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting_worker(limit: Option<usize>) -> (ManagedWorker, Arc<AtomicUsize>) {
        let steps = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&steps);
        let worker = ManagedWorker::new(WorkerConfig::default(), move || {
            let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
            if limit.is_some_and(|limit| n >= limit) {
                Step::Finished
            } else {
                thread::sleep(Duration::from_micros(50));
                Step::Continue
            }
        });
        (worker, steps)
    }

    fn wait_until_down(worker: &ManagedWorker) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while worker.is_running() {
            assert!(std::time::Instant::now() < deadline, "worker never went down");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_start_stop() {
        let (worker, steps) = counting_worker(None);
        assert_eq!(worker.state(), WorkerState::Down);
        assert!(!worker.is_running());

        assert_eq!(worker.start(Timeout::Infinite).unwrap(), Outcome::Done);
        assert!(worker.is_running());

        assert_eq!(worker.stop(Timeout::Infinite).unwrap(), Outcome::Done);
        assert!(!worker.is_running());
        assert!(steps.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn test_repeated_start_and_stop_are_idempotent() {
        let (worker, _) = counting_worker(None);

        assert_eq!(worker.stop(Timeout::Infinite).unwrap(), Outcome::Already);
        assert_eq!(worker.start(Timeout::Infinite).unwrap(), Outcome::Done);
        for _ in 0..8 {
            assert_eq!(worker.start(Timeout::Infinite).unwrap(), Outcome::Already);
        }
        assert_eq!(worker.stop(Timeout::Infinite).unwrap(), Outcome::Done);
        for _ in 0..8 {
            assert_eq!(worker.stop(Timeout::Infinite).unwrap(), Outcome::Already);
        }
    }

    #[test]
    fn test_restart_after_stop() {
        let (worker, _) = counting_worker(None);
        for _ in 0..16 {
            assert_eq!(worker.start(Timeout::Infinite).unwrap(), Outcome::Done);
            assert_eq!(worker.stop(Timeout::Infinite).unwrap(), Outcome::Done);
        }
    }

    #[test]
    fn test_finished_step_stops_worker() {
        let (worker, steps) = counting_worker(Some(1));
        assert_eq!(worker.start(Timeout::Infinite).unwrap(), Outcome::Done);

        wait_until_down(&worker);
        assert_eq!(steps.load(Ordering::Relaxed), 1);
        assert_eq!(worker.stop(Timeout::Infinite).unwrap(), Outcome::Already);
    }

    #[test]
    fn test_stop_timeout_does_not_cancel() {
        let worker = ManagedWorker::new(WorkerConfig::default(), || {
            thread::sleep(Duration::from_millis(200));
            Step::Continue
        });
        assert_eq!(worker.start(Timeout::Infinite).unwrap(), Outcome::Done);

        let result = worker.stop(Duration::from_millis(10).into());
        assert!(matches!(result, Err(WorkerError::Timeout)));
        assert_eq!(worker.state(), WorkerState::Stop);

        // The stop keeps going; a second caller just observes it.
        assert_eq!(worker.stop(Timeout::Infinite).unwrap(), Outcome::Already);
        assert_eq!(worker.state(), WorkerState::Down);
    }

    #[test]
    fn test_huge_timeouts() {
        let (worker, _) = counting_worker(None);
        let forever = Timeout::Duration(Duration::MAX);
        for _ in 0..2 {
            assert_eq!(worker.start(forever).unwrap(), Outcome::Done);
            assert_eq!(worker.state(), WorkerState::Work);
            assert_eq!(worker.stop(forever).unwrap(), Outcome::Done);
            assert_eq!(worker.state(), WorkerState::Down);
        }
    }

    #[test]
    fn test_zero_timeout_start_settles_to_work() {
        let (worker, _) = counting_worker(None);
        match worker.start(Duration::ZERO.into()) {
            Ok(outcome) => assert_eq!(outcome, Outcome::Done),
            Err(e) => assert!(matches!(e, WorkerError::Timeout), "unexpected {e}"),
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while worker.state() != WorkerState::Work {
            assert!(std::time::Instant::now() < deadline, "worker never came up");
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(worker.start(Timeout::Infinite).unwrap(), Outcome::Already);
        assert_eq!(worker.stop(Timeout::Infinite).unwrap(), Outcome::Done);
    }

    #[test]
    fn test_drop_stops_running_worker() {
        let (worker, steps) = counting_worker(None);
        assert_eq!(worker.start(Timeout::Infinite).unwrap(), Outcome::Done);
        drop(worker);

        let after_drop = steps.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(steps.load(Ordering::Relaxed), after_drop);
    }

    #[test]
    fn test_panicking_step_goes_down() {
        let worker = ManagedWorker::new(WorkerConfig::default(), || panic!("step failure"));
        assert_eq!(worker.start(Timeout::Infinite).unwrap(), Outcome::Done);
        wait_until_down(&worker);
        assert_eq!(worker.stop(Timeout::Infinite).unwrap(), Outcome::Already);
    }
}
