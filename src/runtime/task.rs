//! Inter-thread task queues.
//!
//! The only legal way for another thread to affect an event loop is to
//! submit a task to it. A task is pushed onto a bounded channel and the loop's
//! [`Waker`] is kicked so its next `poll` returns and drains the queue on the
//! loop's own thread.

use crate::error::{Error, Result};
use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TrySendError};
use mio::net::TcpStream;
use mio::{Token, Waker};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::warn;

/// Token reserved for the waker in every loop's `Poll`.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

/// Identifies one connection for its whole lifetime.
///
/// `slot` is reused by later connections on the same worker; `serial` is not,
/// so a stale id never matches a newer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId {
    pub worker: usize,
    pub slot: usize,
    pub serial: u64,
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}-c{}", self.worker, self.serial)
    }
}

/// Work a worker loop executes on behalf of other threads.
pub(crate) enum WorkerTask {
    /// Take ownership of a freshly accepted socket.
    Register { stream: TcpStream, peer: SocketAddr },
    /// Close one connection. Ignored if it is already gone.
    Close(ChannelId),
    /// Close every connection gracefully and exit once drained or at `deadline`.
    Shutdown { deadline: Instant },
}

pub(crate) enum AcceptorTask {
    /// Close the listener and exit.
    Shutdown,
}

/// Sending side of a loop's task queue.
pub(crate) struct LoopHandle<T> {
    name: Arc<str>,
    sender: Sender<T>,
    waker: Arc<Waker>,
}

impl<T> Clone for LoopHandle<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            sender: self.sender.clone(),
            waker: Arc::clone(&self.waker),
        }
    }
}

impl<T> LoopHandle<T> {
    pub(crate) fn new(name: impl Into<Arc<str>>, sender: Sender<T>, waker: Arc<Waker>) -> Self {
        Self {
            name: name.into(),
            sender,
            waker,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Queue a task without blocking.
    ///
    /// On failure the task is handed back so the caller can try elsewhere.
    pub(crate) fn try_submit(&self, task: T) -> std::result::Result<(), (Error, T)> {
        match self.sender.try_send(task) {
            Ok(()) => {
                self.wake();
                Ok(())
            }
            Err(TrySendError::Full(task)) => Err((Error::QueueFull(self.name.to_string()), task)),
            Err(TrySendError::Disconnected(task)) => {
                Err((Error::LoopGone(self.name.to_string()), task))
            }
        }
    }

    /// Queue a task, waiting up to `timeout` for room.
    ///
    /// Must not be called from a loop thread.
    pub(crate) fn submit_timeout(&self, task: T, timeout: Duration) -> Result<()> {
        match self.sender.send_timeout(task, timeout) {
            Ok(()) => {
                self.wake();
                Ok(())
            }
            Err(SendTimeoutError::Timeout(_)) => Err(Error::QueueFull(self.name.to_string())),
            Err(SendTimeoutError::Disconnected(_)) => Err(Error::LoopGone(self.name.to_string())),
        }
    }

    /// Kick the loop's `poll` without queueing anything.
    pub(crate) fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!(event_loop = %self.name, error = %e, "Failed to wake event loop");
        }
    }
}

/// Shutdown request shared with a worker outside its task queue.
///
/// Checked by the worker every turn, so a deadline still arrives when the
/// queue is full.
#[derive(Debug, Default)]
pub(crate) struct ShutdownSignal {
    requested: AtomicBool,
    deadline: Mutex<Option<Instant>>,
}

impl ShutdownSignal {
    /// Record `deadline`. An earlier deadline already recorded wins.
    pub(crate) fn request(&self, deadline: Instant) {
        let mut current = self.deadline.lock().unwrap_or_else(PoisonError::into_inner);
        *current = Some(current.map_or(deadline, |d| d.min(deadline)));
        self.requested.store(true, Ordering::Release);
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        if !self.requested.load(Ordering::Acquire) {
            return None;
        }
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Create a bounded task queue for the loop registered under `waker`.
pub(crate) fn task_queue<T>(
    name: impl Into<Arc<str>>,
    capacity: usize,
    waker: Arc<Waker>,
) -> (LoopHandle<T>, Receiver<T>) {
    let (sender, receiver) = crossbeam_channel::bounded(capacity);
    (LoopHandle::new(name, sender, waker), receiver)
}

/// Thread-safe handle used to close a connection from outside its loop.
#[derive(Clone)]
pub struct ChannelHandle {
    id: ChannelId,
    worker: LoopHandle<WorkerTask>,
}

impl ChannelHandle {
    pub(crate) fn new(id: ChannelId, worker: LoopHandle<WorkerTask>) -> Self {
        Self { id, worker }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Ask the owning worker to close this connection.
    ///
    /// Safe to call any number of times, from any thread.
    pub fn close(&self) -> Result<()> {
        self.worker
            .try_submit(WorkerTask::Close(self.id))
            .map_err(|(e, _)| e)
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.id)
            .field("worker", &self.worker.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Events, Poll};

    #[test]
    fn test_submit_wakes_poll() {
        let mut poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).unwrap());
        let (handle, receiver) = task_queue::<AcceptorTask>("acceptor-0", 4, waker);

        handle.try_submit(AcceptorTask::Shutdown).ok().unwrap();

        let mut events = Events::with_capacity(8);
        poll.poll(&mut events, Some(Duration::from_secs(1))).unwrap();
        assert!(events.iter().any(|e| e.token() == WAKER_TOKEN));
        assert!(matches!(receiver.try_recv(), Ok(AcceptorTask::Shutdown)));
    }

    #[test]
    fn test_full_queue_returns_task() {
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).unwrap());
        let (handle, _receiver) = task_queue::<u32>("worker-0", 1, waker);

        handle.try_submit(1).ok().unwrap();
        let (err, task) = handle.try_submit(2).unwrap_err();
        assert!(matches!(err, Error::QueueFull(name) if name == "worker-0"));
        assert_eq!(task, 2);
    }

    #[test]
    fn test_disconnected_queue() {
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).unwrap());
        let (handle, receiver) = task_queue::<u32>("worker-1", 1, waker);
        drop(receiver);

        assert!(matches!(handle.try_submit(1), Err((Error::LoopGone(_), 1))));
        assert!(matches!(
            handle.submit_timeout(1, Duration::from_millis(10)),
            Err(Error::LoopGone(_))
        ));
    }

    #[test]
    fn test_shutdown_signal_keeps_earliest_deadline() {
        let signal = ShutdownSignal::default();
        assert_eq!(signal.deadline(), None);

        let soon = Instant::now() + Duration::from_millis(100);
        signal.request(soon + Duration::from_secs(1));
        signal.request(soon);
        signal.request(soon + Duration::from_secs(5));
        assert_eq!(signal.deadline(), Some(soon));
    }

    #[test]
    fn test_channel_id_display() {
        let id = ChannelId {
            worker: 2,
            slot: 5,
            serial: 17,
        };
        assert_eq!(id.to_string(), "w2-c17");
    }
}
