//! Acceptor event loop.
//!
//! Owns a clone of the listening socket, accepts until the kernel queue is
//! drained, applies per-connection socket options and hands each socket to a
//! worker. The only backpressure is the listen backlog.

use crate::error::Error;
use crate::runtime::mio::WorkerSet;
use crate::runtime::task::AcceptorTask;
use crossbeam_channel::Receiver;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const LISTENER_TOKEN: Token = Token(0);

/// Pause before retrying `accept` after a resource error such as `EMFILE`.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

pub(crate) struct Acceptor {
    id: usize,
    poll: Poll,
    listener: TcpListener,
    tasks: Receiver<AcceptorTask>,
    workers: Arc<WorkerSet>,
    keep_alive: bool,
    no_delay: bool,
    events_capacity: usize,
}

impl Acceptor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: usize,
        poll: Poll,
        listener: std::net::TcpListener,
        tasks: Receiver<AcceptorTask>,
        workers: Arc<WorkerSet>,
        keep_alive: bool,
        no_delay: bool,
        events_capacity: usize,
    ) -> io::Result<Self> {
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            id,
            poll,
            listener,
            tasks,
            workers,
            keep_alive,
            no_delay,
            events_capacity,
        })
    }

    /// Accept connections until a shutdown task arrives or polling fails.
    pub(crate) fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.events_capacity);
        let mut backoff = false;

        info!(
            acceptor = self.id,
            addr = ?self.listener.local_addr().ok(),
            "Acceptor started"
        );

        loop {
            let timeout = backoff.then_some(ACCEPT_BACKOFF);
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            let mut listener_ready = backoff;
            for event in events.iter() {
                if event.token() == LISTENER_TOKEN {
                    listener_ready = true;
                }
            }
            if listener_ready {
                backoff = !self.accept_connections();
            }

            if self.shutdown_requested() {
                let _ = self.poll.registry().deregister(&mut self.listener);
                info!(acceptor = self.id, "Acceptor stopped");
                return Ok(());
            }
        }
    }

    fn shutdown_requested(&self) -> bool {
        let mut shutdown = false;
        while let Ok(task) = self.tasks.try_recv() {
            match task {
                AcceptorTask::Shutdown => shutdown = true,
            }
        }
        shutdown
    }

    /// Accept until `WouldBlock`. Returns `false` if accepting stopped on an
    /// error and should be retried after a pause.
    fn accept_connections(&mut self) -> bool {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.hand_off(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted
                            | io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    debug!(acceptor = self.id, error = %e, "Transient accept error");
                }
                Err(e) => {
                    let err = Error::Accept(e);
                    warn!(acceptor = self.id, error = %err, "Accept failed, backing off");
                    return false;
                }
            }
        }
    }

    fn hand_off(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = configure_stream(&stream, self.keep_alive, self.no_delay) {
            debug!(peer = %peer, error = %e, "Failed to apply socket options");
        }

        match self.workers.dispatch(stream, peer) {
            Ok(worker) => debug!(acceptor = self.id, worker, peer = %peer, "Handed off connection"),
            Err(e) => warn!(peer = %peer, error = %e, "Dropping connection"),
        }
    }
}

/// Apply per-connection options to an accepted socket.
fn configure_stream(stream: &TcpStream, keep_alive: bool, no_delay: bool) -> io::Result<()> {
    stream.set_nodelay(no_delay)?;
    socket2::SockRef::from(stream).set_keepalive(keep_alive)?;
    Ok(())
}

/// Bind the listening socket shared by all acceptors.
///
/// `SO_REUSEADDR` lets a restarted server rebind while old connections sit
/// in `TIME_WAIT`; a port held by a live listener still fails to bind.
pub(crate) fn bind_listener(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_listener_ephemeral() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_bind_listener_port_in_use() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = holder.local_addr().unwrap();
        let err = bind_listener(addr, 16).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[test]
    fn test_configure_stream_applies_options() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        let stream = TcpStream::from_std(accepted);

        configure_stream(&stream, true, true).unwrap();
        assert!(stream.nodelay().unwrap());
        assert!(socket2::SockRef::from(&stream).keepalive().unwrap());

        configure_stream(&stream, false, false).unwrap();
        assert!(!stream.nodelay().unwrap());
        assert!(!socket2::SockRef::from(&stream).keepalive().unwrap());
    }
}
