//! Elastic worker pool.
//!
//! `launch()` hands a job to a waiting idle worker when there is one and
//! spawns a new thread otherwise. A worker that finishes its job waits on
//! the shared queue for `idle_timeout` before exiting, so the number of
//! threads follows the number of concurrently busy connections.

use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendError, Sender, unbounded};
use tracing::{debug, error, trace};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug)]
struct State {
    /// Workers waiting on the queue that no launcher has claimed yet.
    idle: usize,
    live: usize,
    running: bool,
}

struct Shared {
    state: Mutex<State>,
    exited: Condvar,
    idle_timeout: Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    tx: Mutex<Option<Sender<Job>>>,
    rx: Receiver<Job>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(idle_timeout: Duration) -> Self {
        let (tx, rx) = unbounded();
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    idle: 0,
                    live: 0,
                    running: true,
                }),
                exited: Condvar::new(),
                idle_timeout,
            }),
            tx: Mutex::new(Some(tx)),
            rx,
        }
    }

    /// Run `job` on a pool thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool is stopped or a thread cannot be
    /// spawned; only this job is affected.
    pub fn launch(&self, mut job: Job) -> io::Result<()> {
        let mut state = self.shared.lock();
        if !state.running {
            return Err(io::Error::other("worker pool is stopped"));
        }

        if state.idle > 0 {
            let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(tx) = tx.as_ref() {
                match tx.send(job) {
                    Ok(()) => {
                        state.idle -= 1;
                        trace!(idle = state.idle, "handed job to idle worker");
                        return Ok(());
                    }
                    Err(SendError(returned)) => job = returned,
                }
            }
        }

        state.live += 1;
        let live = state.live;
        drop(state);

        let shared = Arc::clone(&self.shared);
        let rx = self.rx.clone();
        let spawned = std::thread::Builder::new()
            .name("warden-worker".into())
            .spawn(move || worker_loop(&shared, &rx, job));

        match spawned {
            Ok(_) => {
                debug!(live, "spawned worker");
                Ok(())
            }
            Err(e) => {
                let mut state = self.shared.lock();
                state.live -= 1;
                self.shared.exited.notify_all();
                Err(e)
            }
        }
    }

    /// Stop accepting jobs and let idle workers exit.
    pub fn stop(&self) {
        let mut state = self.shared.lock();
        state.running = false;
        // Dropping the sender disconnects the queue and wakes every waiter.
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Block until every worker has exited or `timeout` elapses. Returns
    /// whether all workers exited.
    pub fn wait(&self, timeout: Duration) -> bool {
        let state = self.shared.lock();
        let (state, _) = self
            .shared
            .exited
            .wait_timeout_while(state, timeout, |s| s.live > 0)
            .unwrap_or_else(PoisonError::into_inner);
        state.live == 0
    }

    #[must_use]
    pub fn live_workers(&self) -> usize {
        self.shared.lock().live
    }

    /// Workers currently running a job.
    #[must_use]
    pub fn busy_workers(&self) -> usize {
        let state = self.shared.lock();
        state.live.saturating_sub(state.idle)
    }
}

fn run_job(job: Job) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!("worker job panicked");
    }
}

fn worker_loop(shared: &Shared, rx: &Receiver<Job>, first: Job) {
    let mut job = first;
    loop {
        run_job(job);

        {
            let mut state = shared.lock();
            if !state.running {
                break;
            }
            state.idle += 1;
        }

        job = match rx.recv_timeout(shared.idle_timeout) {
            Ok(next) => next,
            Err(RecvTimeoutError::Timeout) => {
                let mut state = shared.lock();
                if state.idle > 0 {
                    state.idle -= 1;
                    break;
                }
                // A launcher claimed this worker after the wait expired; its
                // job is already queued.
                match rx.try_recv() {
                    Ok(next) => next,
                    Err(_) => break,
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                let mut state = shared.lock();
                state.idle = state.idle.saturating_sub(1);
                break;
            }
        };
    }

    let mut state = shared.lock();
    state.live -= 1;
    trace!(live = state.live, "worker exiting");
    shared.exited.notify_all();
}
