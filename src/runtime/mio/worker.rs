//! Worker event loop.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls. Each worker owns its
//! connections, its buffer pool and a task queue that other threads use to
//! register sockets or request closes.

use crate::error::Error;
use crate::runtime::buffer::{BufferPool, BufferStats};
use crate::runtime::connection::{Channel, ConnState, Connection, ConnectionRegistry};
use crate::runtime::pipeline::{PipelineBuilder, PipelineFactory};
use crate::runtime::task::{
    ChannelHandle, ChannelId, LoopHandle, ShutdownSignal, WorkerTask, WAKER_TOKEN,
};
use crossbeam_channel::Receiver;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Reads serviced for one connection before yielding to the others.
const MAX_READS_PER_TURN: usize = 32;

/// Sizing for one worker loop.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkerSettings {
    pub(crate) read_buffer_size: usize,
    pub(crate) max_buffers: usize,
    pub(crate) max_connections: usize,
    pub(crate) events_capacity: usize,
}

/// A worker loop. Built on its own thread, since connections hold handlers
/// that are not `Send`.
pub(crate) struct Worker {
    id: usize,
    poll: Poll,
    tasks: Receiver<WorkerTask>,
    handle: LoopHandle<WorkerTask>,
    connections: ConnectionRegistry<Connection>,
    buffers: BufferPool,
    factory: Arc<dyn PipelineFactory>,
    load: Arc<AtomicUsize>,
    shutdown: Arc<ShutdownSignal>,
    settings: WorkerSettings,
    next_serial: u64,
    /// Connections that hit the read budget and still have data waiting.
    read_backlog: Vec<usize>,
    /// Set once shutdown has been requested.
    deadline: Option<Instant>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: usize,
        poll: Poll,
        tasks: Receiver<WorkerTask>,
        handle: LoopHandle<WorkerTask>,
        factory: Arc<dyn PipelineFactory>,
        stats: Arc<BufferStats>,
        load: Arc<AtomicUsize>,
        shutdown: Arc<ShutdownSignal>,
        settings: WorkerSettings,
    ) -> Self {
        let buffers =
            BufferPool::new(settings.max_buffers, settings.read_buffer_size).with_stats(stats);

        Self {
            id,
            poll,
            tasks,
            handle,
            connections: ConnectionRegistry::new(settings.max_connections),
            buffers,
            factory,
            load,
            shutdown,
            settings,
            next_serial: 0,
            read_backlog: Vec::new(),
            deadline: None,
        }
    }

    /// Run until shut down or until polling fails.
    ///
    /// Every connection is closed before this returns, whatever the outcome.
    pub(crate) fn run(mut self) -> io::Result<()> {
        info!(
            worker = self.id,
            max_connections = self.settings.max_connections,
            buffer_size = self.settings.read_buffer_size,
            "Worker started"
        );

        let result = self.event_loop();
        self.force_close_all();

        info!(worker = self.id, "Worker stopped");
        result
    }

    fn event_loop(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.settings.events_capacity);

        loop {
            let timeout = self.poll_timeout();
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => {}
                    Token(slot) => {
                        if event.is_readable() || event.is_read_closed() || event.is_error() {
                            self.handle_readable(slot);
                        }
                        if event.is_writable() {
                            self.handle_writable(slot);
                        }
                        self.after_dispatch(slot);
                    }
                }
            }

            for slot in std::mem::take(&mut self.read_backlog) {
                self.handle_readable(slot);
                self.after_dispatch(slot);
            }

            self.drain_tasks();

            if self.deadline.is_none() {
                if let Some(deadline) = self.shutdown.deadline() {
                    self.begin_shutdown(deadline);
                }
            }

            if let Some(deadline) = self.deadline {
                if self.connections.is_empty() {
                    return Ok(());
                }
                if Instant::now() >= deadline {
                    warn!(
                        worker = self.id,
                        remaining = self.connections.len(),
                        "Shutdown timeout reached, forcing connections closed"
                    );
                    return Ok(());
                }
            }
        }
    }

    fn poll_timeout(&self) -> Option<Duration> {
        if !self.read_backlog.is_empty() {
            return Some(Duration::ZERO);
        }
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn drain_tasks(&mut self) {
        while let Ok(task) = self.tasks.try_recv() {
            match task {
                WorkerTask::Register { stream, peer } => self.register(stream, peer),
                WorkerTask::Close(id) => self.request_close(id),
                WorkerTask::Shutdown { deadline } => self.begin_shutdown(deadline),
            }
        }
    }

    /// Take over a dispatched socket. The dispatcher already counted it in
    /// `load`, so every path that drops it gives the count back.
    fn register(&mut self, stream: TcpStream, peer: SocketAddr) {
        if !self.try_register(stream, peer) {
            self.load.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn try_register(&mut self, stream: TcpStream, peer: SocketAddr) -> bool {
        if self.deadline.is_some() {
            debug!(worker = self.id, peer = %peer, "Dropping connection handed over during shutdown");
            return false;
        }

        let Some(slot) = self.connections.vacant_key() else {
            warn!(worker = self.id, peer = %peer, "Connection limit reached");
            return false;
        };

        let id = ChannelId {
            worker: self.id,
            slot,
            serial: self.next_serial,
        };
        self.next_serial += 1;

        let mut builder = PipelineBuilder::new(id, peer);
        let factory = &self.factory;
        match catch_unwind(AssertUnwindSafe(|| factory.init_pipeline(&mut builder))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(conn_id = %id, peer = %peer, error = %e, "Pipeline initialization failed");
                return false;
            }
            Err(_) => {
                warn!(conn_id = %id, peer = %peer, "Pipeline factory panicked");
                return false;
            }
        }

        // From here on the pipeline exists, so every failure closes through
        // close_connection and the handlers see on_closed.
        let channel = Channel::new(id, peer, ChannelHandle::new(id, self.handle.clone()));
        let mut conn = Connection::new(stream, channel, builder.build());
        conn.transition(ConnState::Registered);

        let slot = match self.connections.insert(conn) {
            Ok(slot) => slot,
            Err(conn) => {
                warn!(conn_id = %id, "Connection registry full");
                self.close_connection(conn);
                return false;
            }
        };

        let Some(conn) = self.connections.get_mut(slot) else {
            return false;
        };
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut conn.stream, Token(slot), Interest::READABLE)
        {
            warn!(conn_id = %id, error = %e, "Failed to register connection");
            if let Some(conn) = self.connections.remove(slot) {
                self.close_connection(conn);
            }
            return false;
        }
        conn.transition(ConnState::Open);

        debug!(worker = self.id, conn_id = %id, peer = %peer, "Accepted connection");
        true
    }

    fn handle_readable(&mut self, slot: usize) {
        for _ in 0..MAX_READS_PER_TURN {
            let Some(conn) = self.connections.get_mut(slot) else {
                return;
            };
            if conn.state() != ConnState::Open || conn.channel.close_requested {
                return;
            }

            let buf = match self.buffers.alloc(Some(conn.channel.id.serial)) {
                Ok(buf) => buf,
                Err(e) => {
                    self.raise_error(slot, e);
                    return;
                }
            };

            let read = match self.buffers.read_target(buf) {
                Ok(target) => conn.stream.read(target),
                Err(e) => {
                    self.raise_error(slot, e);
                    return;
                }
            };

            match read {
                Ok(0) => {
                    let _ = self.buffers.release(buf);
                    debug!(conn_id = %conn.channel.id, "Peer closed connection");
                    conn.channel.close_requested = true;
                    return;
                }
                Ok(n) => {
                    let _ = self.buffers.set_len(buf, n);
                    conn.bytes_read += n as u64;
                    trace!(conn_id = %conn.channel.id, bytes = n, "Read");

                    let dispatched =
                        conn.pipeline
                            .fire_data_received(&mut conn.channel, &mut self.buffers, buf);
                    if let Err(e) = dispatched {
                        self.raise_error(slot, e);
                        return;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let _ = self.buffers.release(buf);
                    return;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    let _ = self.buffers.release(buf);
                }
                Err(e) => {
                    let _ = self.buffers.release(buf);
                    self.raise_error(slot, Error::Connection(e));
                    return;
                }
            }
        }

        // Budget used up; mio will not report this socket again until it is
        // drained, so come back to it on the next turn.
        self.read_backlog.push(slot);
    }

    fn handle_writable(&mut self, slot: usize) {
        let Some(conn) = self.connections.get_mut(slot) else {
            return;
        };
        if let Err(e) = flush_outbound(conn, &mut self.buffers) {
            self.raise_error(slot, Error::Connection(e));
        }
    }

    /// Deliver an error to the pipeline, then close.
    fn raise_error(&mut self, slot: usize, cause: Error) {
        let Some(conn) = self.connections.get_mut(slot) else {
            return;
        };
        debug!(conn_id = %conn.channel.id, error = %cause, "Connection error");

        conn.pipeline
            .fire_error(&mut conn.channel, &mut self.buffers, &cause);

        if !conn.channel.close_requested {
            debug!(
                conn_id = %conn.channel.id,
                "No handler closed the connection after an error, closing"
            );
            conn.channel.close_requested = true;
        }
    }

    /// Apply close requests and flush queued writes after an event.
    fn after_dispatch(&mut self, slot: usize) {
        let Some(conn) = self.connections.get_mut(slot) else {
            return;
        };

        if conn.channel.close_requested && !conn.is_closing() {
            conn.transition(ConnState::Closing);
        }

        if conn.has_pending_writes() {
            if let Err(e) = flush_outbound(conn, &mut self.buffers) {
                self.raise_error(slot, Error::Connection(e));
                self.teardown(slot);
                return;
            }
        }

        let Some(conn) = self.connections.get_mut(slot) else {
            return;
        };
        if conn.has_pending_writes() != conn.write_interest {
            let interest = if conn.has_pending_writes() {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            match self
                .poll
                .registry()
                .reregister(&mut conn.stream, Token(slot), interest)
            {
                Ok(()) => conn.write_interest = !conn.write_interest,
                Err(e) => {
                    self.raise_error(slot, Error::Connection(e));
                    self.teardown(slot);
                    return;
                }
            }
        }

        if conn.is_closing() && !conn.has_pending_writes() {
            self.teardown(slot);
        }
    }

    fn request_close(&mut self, id: ChannelId) {
        match self.connections.get_mut(id.slot) {
            Some(conn) if conn.channel.id == id => {
                conn.channel.close_requested = true;
                self.after_dispatch(id.slot);
            }
            _ => debug!(conn_id = %id, "Close requested for a connection that is already gone"),
        }
    }

    fn begin_shutdown(&mut self, deadline: Instant) {
        if self.deadline.is_none() {
            info!(
                worker = self.id,
                connections = self.connections.len(),
                "Worker shutting down"
            );
        }
        self.deadline = Some(self.deadline.map_or(deadline, |d| d.min(deadline)));

        for slot in self.connections.keys() {
            if let Some(conn) = self.connections.get_mut(slot) {
                conn.channel.close_requested = true;
            }
            self.after_dispatch(slot);
        }
    }

    fn teardown(&mut self, slot: usize) {
        let Some(conn) = self.connections.remove(slot) else {
            return;
        };
        self.close_connection(conn);
        self.load.fetch_sub(1, Ordering::Relaxed);
    }

    /// Release everything the connection holds and notify its pipeline.
    fn close_connection(&mut self, mut conn: Connection) {
        if !conn.is_closing() {
            conn.transition(ConnState::Closing);
        }
        conn.transition(ConnState::Closed);

        let _ = self.poll.registry().deregister(&mut conn.stream);
        let _ = conn.stream.shutdown(Shutdown::Both);

        let unflushed = conn.channel.outbound.len();
        for buf in conn.channel.outbound.drain(..) {
            if self.buffers.ref_count(buf).is_some() {
                let _ = self.buffers.release(buf);
            }
        }

        conn.pipeline
            .fire_closed(&mut conn.channel, &mut self.buffers);

        let leaked = self.buffers.force_release_owned_by(conn.channel.id.serial);
        if leaked > 0 {
            warn!(
                conn_id = %conn.channel.id,
                leaked,
                "Force-released buffers still held at close"
            );
        }

        debug!(
            worker = self.id,
            conn_id = %conn.channel.id,
            bytes = conn.bytes_read,
            unflushed,
            "Connection closed"
        );
    }

    fn force_close_all(&mut self) {
        for slot in self.connections.keys() {
            self.teardown(slot);
        }
    }
}

/// Write queued buffers until the queue is empty or the socket would block.
fn flush_outbound(conn: &mut Connection, buffers: &mut BufferPool) -> io::Result<()> {
    while let Some(&buf) = conn.channel.outbound.front() {
        if buffers.ref_count(buf).is_none() {
            // Released behind our back; nothing left to send from it.
            conn.channel.outbound.pop_front();
            conn.channel.written = 0;
            continue;
        }

        let result = match buffers.get(buf) {
            Ok(data) if conn.channel.written < data.len() => conn
                .stream
                .write(&data[conn.channel.written..])
                .map(|n| (n, conn.channel.written + n >= data.len())),
            Ok(_) => Ok((0, true)),
            Err(e) => return Err(io::Error::new(io::ErrorKind::Other, e)),
        };

        match result {
            Ok((n, done)) => {
                if n == 0 && !done {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                conn.channel.written += n;
                if done {
                    conn.channel.outbound.pop_front();
                    conn.channel.written = 0;
                    let _ = buffers.release(buf);
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
