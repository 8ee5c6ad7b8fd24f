//! mio-based event loop groups.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS). One
//! thread per loop: acceptor loops own clones of the listening socket and
//! hand accepted sockets to worker loops, which own the connections.

mod acceptor;
mod worker;

pub(crate) use acceptor::{bind_listener, Acceptor};
pub(crate) use worker::{Worker, WorkerSettings};

use crate::error::{Error, Result};
use crate::options::SelectionPolicy;
use crate::runtime::task::{LoopHandle, ShutdownSignal, WorkerTask};
use mio::net::TcpStream;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// Sending side of one worker loop plus its load counters.
pub(crate) struct WorkerRef {
    pub(crate) handle: LoopHandle<WorkerTask>,
    /// Connections owned by the worker or queued for it. Incremented on
    /// dispatch; the worker decrements it when a connection closes or
    /// fails to register.
    pub(crate) load: Arc<AtomicUsize>,
    pub(crate) shutdown: Arc<ShutdownSignal>,
    /// Connections ever assigned to the worker.
    assigned: AtomicUsize,
}

impl WorkerRef {
    pub(crate) fn new(
        handle: LoopHandle<WorkerTask>,
        load: Arc<AtomicUsize>,
        shutdown: Arc<ShutdownSignal>,
    ) -> Self {
        Self {
            handle,
            load,
            shutdown,
            assigned: AtomicUsize::new(0),
        }
    }
}

/// The worker group as seen by acceptors and the bootstrap.
pub(crate) struct WorkerSet {
    workers: Vec<WorkerRef>,
    policy: SelectionPolicy,
    next: AtomicUsize,
}

impl WorkerSet {
    pub(crate) fn new(workers: Vec<WorkerRef>, policy: SelectionPolicy) -> Self {
        Self {
            workers,
            policy,
            next: AtomicUsize::new(0),
        }
    }

    pub(crate) fn get(&self, index: usize) -> Option<&WorkerRef> {
        self.workers.get(index)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &WorkerRef> {
        self.workers.iter()
    }

    /// Index of the worker the next connection should go to.
    pub(crate) fn select(&self) -> usize {
        let count = self.workers.len().max(1);
        match self.policy {
            SelectionPolicy::RoundRobin => self.next.fetch_add(1, Ordering::Relaxed) % count,
            SelectionPolicy::LeastLoaded => self
                .workers
                .iter()
                .enumerate()
                .min_by_key(|(index, worker)| (worker.load.load(Ordering::Relaxed), *index))
                .map(|(index, _)| index)
                .unwrap_or(0),
        }
    }

    /// Hand an accepted socket to a worker.
    ///
    /// Starts from the selected worker and moves on to the next one if its
    /// queue is full or it has exited. Returns the index of the worker that
    /// took the socket; if none did, the socket is dropped (and closed).
    pub(crate) fn dispatch(&self, stream: TcpStream, peer: SocketAddr) -> Result<usize> {
        let count = self.workers.len();
        let first = self.select();
        let mut task = WorkerTask::Register { stream, peer };

        for offset in 0..count {
            let index = (first + offset) % count;
            let worker = &self.workers[index];
            // Counted before the worker sees it, so a burst of accepts
            // spreads under LeastLoaded.
            worker.load.fetch_add(1, Ordering::Relaxed);
            match worker.handle.try_submit(task) {
                Ok(()) => {
                    worker.assigned.fetch_add(1, Ordering::Relaxed);
                    return Ok(index);
                }
                Err((e, returned)) => {
                    worker.load.fetch_sub(1, Ordering::Relaxed);
                    debug!(worker = index, error = %e, "Worker unavailable, trying next");
                    task = returned;
                }
            }
        }

        Err(Error::QueueFull("all workers".to_string()))
    }

    /// Connections assigned to each worker since start.
    pub(crate) fn assigned(&self) -> Vec<usize> {
        self.workers
            .iter()
            .map(|worker| worker.assigned.load(Ordering::Relaxed))
            .collect()
    }
}

#[derive(Default)]
struct TrackerState {
    live: usize,
    /// First fatal loop failure: loop name, error kind, message.
    failure: Option<(String, io::ErrorKind, String)>,
}

/// Counts running loop threads and remembers the first fatal failure.
#[derive(Default)]
pub(crate) struct LoopTracker {
    state: Mutex<TrackerState>,
    cond: Condvar,
}

impl LoopTracker {
    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn live(&self) -> usize {
        self.lock().live
    }

    /// Block until every loop has exited, or until one of them fails.
    pub(crate) fn wait(&self) -> Result<()> {
        let mut state = self.lock();
        loop {
            if let Some((name, kind, message)) = &state.failure {
                return Err(Error::LoopFailed {
                    name: name.clone(),
                    source: io::Error::new(*kind, message.clone()),
                });
            }
            if state.live == 0 {
                return Ok(());
            }
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn exited(&self, name: &str, failure: Option<io::Error>) {
        let mut state = self.lock();
        state.live = state.live.saturating_sub(1);
        if let Some(e) = failure {
            if state.failure.is_none() {
                state.failure = Some((name.to_string(), e.kind(), e.to_string()));
            }
        }
        self.cond.notify_all();
    }
}

/// Reports a loop's exit to the tracker, including exits by panic.
struct LoopGuard {
    tracker: Arc<LoopTracker>,
    name: String,
    failure: Option<io::Error>,
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        let failure = self.failure.take().or_else(|| {
            thread::panicking().then(|| io::Error::new(io::ErrorKind::Other, "event loop panicked"))
        });
        self.tracker.exited(&self.name, failure);
    }
}

/// Spawn a named loop thread tracked by `tracker`.
pub(crate) fn spawn_loop<F>(
    name: String,
    tracker: &Arc<LoopTracker>,
    body: F,
) -> io::Result<JoinHandle<()>>
where
    F: FnOnce() -> io::Result<()> + Send + 'static,
{
    tracker.lock().live += 1;

    let guard_tracker = Arc::clone(tracker);
    let loop_name = name.clone();
    let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
        let mut guard = LoopGuard {
            tracker: guard_tracker,
            name: loop_name,
            failure: None,
        };
        if let Err(e) = body() {
            error!(event_loop = %guard.name, error = %e, "Event loop failed");
            guard.failure = Some(e);
        }
    });

    if spawned.is_err() {
        tracker.exited(&name, None);
    }
    spawned
}
