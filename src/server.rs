//! Server bootstrap.
//!
//! Binds the listening socket, starts the acceptor and worker loop groups and
//! owns their shutdown. One bootstrap runs one server; it is never global.
//!
//! ```no_run
//! use discard_server::{DiscardHandler, PipelineBuilder, ServerBootstrap, ServerOptions};
//!
//! let server = ServerBootstrap::new(ServerOptions::default())
//!     .child_handler(|pipeline: &mut PipelineBuilder| -> discard_server::Result<()> {
//!         pipeline.add_last(DiscardHandler::new());
//!         Ok(())
//!     });
//! let addr = server.start(8080)?;
//! println!("listening on {addr}");
//! server.await_termination()?;
//! # Ok::<(), discard_server::Error>(())
//! ```

use crate::error::{Error, Result};
use crate::options::{ServerOptions, DEFAULT_SHUTDOWN_TIMEOUT};
use crate::runtime::mio::{
    bind_listener, spawn_loop, Acceptor, LoopTracker, Worker, WorkerRef, WorkerSet,
    WorkerSettings,
};
use crate::runtime::task::{
    task_queue, AcceptorTask, LoopHandle, ShutdownSignal, WorkerTask, WAKER_TOKEN,
};
use crate::runtime::{BufferStats, BufferStatsSnapshot, ChannelId, PipelineBuilder, PipelineFactory};
use mio::{Poll, Waker};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long `shutdown` waits for room in an acceptor's task queue.
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(1);

enum State {
    Idle,
    Running(Running),
    Terminated,
}

struct Running {
    local_addr: SocketAddr,
    acceptors: Vec<LoopHandle<AcceptorTask>>,
    workers: Arc<WorkerSet>,
    acceptor_threads: Vec<JoinHandle<()>>,
    worker_threads: Vec<JoinHandle<()>>,
}

impl Running {
    /// Stop acceptors first so no new connections arrive, then drain workers.
    fn stop(self, timeout: Duration) {
        for acceptor in &self.acceptors {
            if let Err(e) = acceptor.submit_timeout(AcceptorTask::Shutdown, SUBMIT_TIMEOUT) {
                debug!(event_loop = acceptor.name(), error = %e, "Acceptor already stopped");
            }
        }
        join_all(self.acceptor_threads);

        let deadline = Instant::now() + timeout;
        for worker in self.workers.iter() {
            worker.shutdown.request(deadline);
            match worker.handle.try_submit(WorkerTask::Shutdown { deadline }) {
                Ok(()) => {}
                Err((Error::QueueFull(_), _)) => {
                    // The worker reads the deadline from the signal instead
                    debug!(event_loop = worker.handle.name(), "Worker queue full, waking it");
                    worker.handle.wake();
                }
                Err((e, _)) => {
                    debug!(event_loop = worker.handle.name(), error = %e, "Worker already stopped");
                }
            }
        }
        join_all(self.worker_threads);
    }
}

fn join_all(threads: Vec<JoinHandle<()>>) {
    for thread in threads {
        let name = thread.thread().name().unwrap_or("event-loop").to_string();
        if thread.join().is_err() {
            warn!(event_loop = %name, "Event loop thread panicked");
        }
    }
}

/// Pipeline used when no child handler is configured: the tail releases
/// every buffer.
fn empty_pipeline(_pipeline: &mut PipelineBuilder) -> Result<()> {
    Ok(())
}

/// Assembles and runs a server.
pub struct ServerBootstrap {
    options: ServerOptions,
    factory: Arc<dyn PipelineFactory>,
    stats: Arc<BufferStats>,
    tracker: Arc<LoopTracker>,
    state: Mutex<State>,
}

impl ServerBootstrap {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            options,
            factory: Arc::new(empty_pipeline),
            stats: Arc::new(BufferStats::default()),
            tracker: Arc::new(LoopTracker::default()),
            state: Mutex::new(State::Idle),
        }
    }

    /// Set the factory that builds each accepted connection's pipeline.
    pub fn child_handler(mut self, factory: impl PipelineFactory) -> Self {
        self.factory = Arc::new(factory);
        self
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind `port` on the configured host and start accepting.
    ///
    /// Port 0 binds an ephemeral port. Returns the bound address. If binding
    /// fails no loop is started.
    pub fn start(&self, port: u16) -> Result<SocketAddr> {
        self.options.validate()?;

        let mut state = self.lock();
        if !matches!(*state, State::Idle) {
            return Err(Error::AlreadyStarted);
        }

        let addr = self.options.bind_addr(port);
        let listener =
            bind_listener(addr, self.options.backlog).map_err(|source| Error::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let running = self.launch(listener, local_addr)?;
        *state = State::Running(running);

        info!(
            addr = %local_addr,
            acceptors = self.options.acceptor_threads,
            workers = self.options.worker_threads,
            backlog = self.options.backlog,
            selection = ?self.options.selection,
            "Listening"
        );
        Ok(local_addr)
    }

    fn launch(&self, listener: std::net::TcpListener, local_addr: SocketAddr) -> Result<Running> {
        let mut refs = Vec::with_capacity(self.options.worker_threads);
        let mut worker_threads = Vec::with_capacity(self.options.worker_threads);
        let spawned = self.spawn_workers(&mut refs, &mut worker_threads);

        let mut running = Running {
            local_addr,
            acceptors: Vec::new(),
            workers: Arc::new(WorkerSet::new(refs, self.options.selection)),
            acceptor_threads: Vec::new(),
            worker_threads,
        };

        let spawned = spawned.and_then(|()| self.spawn_acceptors(&listener, &mut running));
        match spawned {
            Ok(()) => Ok(running),
            Err(e) => {
                warn!(error = %e, "Failed to start event loops, stopping the ones already running");
                running.stop(Duration::ZERO);
                Err(e)
            }
        }
    }

    fn spawn_workers(
        &self,
        refs: &mut Vec<WorkerRef>,
        threads: &mut Vec<JoinHandle<()>>,
    ) -> Result<()> {
        let settings = WorkerSettings {
            read_buffer_size: self.options.read_buffer_size,
            max_buffers: self.options.max_buffers_per_worker,
            max_connections: self.options.max_connections_per_worker,
            events_capacity: self.options.events_capacity,
        };

        for id in 0..self.options.worker_threads {
            let name = format!("worker-{id}");
            let poll = Poll::new()?;
            let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
            let (handle, tasks) =
                task_queue::<WorkerTask>(name.as_str(), self.options.task_queue_capacity, waker);
            let load = Arc::new(AtomicUsize::new(0));
            let shutdown = Arc::new(ShutdownSignal::default());

            let worker_handle = handle.clone();
            let worker_load = Arc::clone(&load);
            let worker_shutdown = Arc::clone(&shutdown);
            let factory = Arc::clone(&self.factory);
            let stats = Arc::clone(&self.stats);
            let thread = spawn_loop(name, &self.tracker, move || {
                Worker::new(
                    id,
                    poll,
                    tasks,
                    worker_handle,
                    factory,
                    stats,
                    worker_load,
                    worker_shutdown,
                    settings,
                )
                .run()
            })?;

            refs.push(WorkerRef::new(handle, load, shutdown));
            threads.push(thread);
        }
        Ok(())
    }

    fn spawn_acceptors(&self, listener: &std::net::TcpListener, running: &mut Running) -> Result<()> {
        for id in 0..self.options.acceptor_threads {
            let name = format!("acceptor-{id}");
            let poll = Poll::new()?;
            let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
            let (handle, tasks) = task_queue::<AcceptorTask>(name.as_str(), 1, waker);

            let acceptor = Acceptor::new(
                id,
                poll,
                listener.try_clone()?,
                tasks,
                Arc::clone(&running.workers),
                self.options.keep_alive,
                self.options.no_delay,
                self.options.events_capacity,
            )?;
            let thread = spawn_loop(name, &self.tracker, move || acceptor.run())?;

            running.acceptors.push(handle);
            running.acceptor_threads.push(thread);
        }
        Ok(())
    }

    /// Block until every event loop has exited.
    ///
    /// Returns as soon as any loop dies from a fatal error. Returns
    /// immediately if the server was never started.
    pub fn await_termination(&self) -> Result<()> {
        self.tracker.wait()
    }

    /// Stop accepting, close connections gracefully and join every loop.
    ///
    /// Connections still open at `timeout` are closed forcibly. Calling this
    /// more than once is harmless. Must not be called from a handler.
    pub fn shutdown(&self, timeout: Duration) {
        let previous = std::mem::replace(&mut *self.lock(), State::Terminated);
        if let State::Running(running) = previous {
            info!(addr = %running.local_addr, timeout = ?timeout, "Shutting down");
            running.stop(timeout);
            info!("Server stopped");
        }
    }

    /// Ask the worker owning `id` to close that connection.
    ///
    /// Closing a connection that is already gone is not an error.
    pub fn close_channel(&self, id: ChannelId) -> Result<()> {
        let state = self.lock();
        let State::Running(running) = &*state else {
            return Ok(());
        };
        match running.workers.get(id.worker) {
            Some(worker) => worker
                .handle
                .try_submit(WorkerTask::Close(id))
                .map_err(|(e, _)| e),
            None => {
                debug!(conn_id = %id, "Close requested for an unknown worker");
                Ok(())
            }
        }
    }

    /// Address the server is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.lock() {
            State::Running(running) => Some(running.local_addr),
            _ => None,
        }
    }

    /// Buffer audit counters summed over every worker.
    pub fn buffer_stats(&self) -> BufferStatsSnapshot {
        self.stats.snapshot()
    }

    /// Connections each worker has been handed since start.
    pub fn connections_per_worker(&self) -> Vec<usize> {
        match &*self.lock() {
            State::Running(running) => running.workers.assigned(),
            _ => Vec::new(),
        }
    }

    /// Connections each worker currently owns, counting ones handed to it
    /// but not yet registered.
    pub fn active_connections(&self) -> Vec<usize> {
        match &*self.lock() {
            State::Running(running) => running
                .workers
                .iter()
                .map(|worker| worker.load.load(Ordering::Relaxed))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Event loop threads still running.
    pub fn running_loops(&self) -> usize {
        self.tracker.live()
    }
}

impl Drop for ServerBootstrap {
    fn drop(&mut self) {
        self.shutdown(DEFAULT_SHUTDOWN_TIMEOUT);
    }
}
