//! Error taxonomy for the server core.
//!
//! Per-connection failures (`Connection`, `Handler`) are delivered to the
//! owning pipeline and never leave that connection. `Bind` and `LoopFailed`
//! are surfaced to whoever owns the [`ServerBootstrap`](crate::ServerBootstrap).

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The listening socket could not be bound. Fatal to startup.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Accepting a single connection failed. The acceptor keeps running.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// I/O failure on an established connection.
    #[error("connection error: {0}")]
    Connection(#[source] io::Error),

    /// A handler returned an error or panicked while processing an event.
    #[error("handler failed: {0}")]
    Handler(String),

    /// A buffer was accessed or released after its last reference was gone.
    #[error("buffer {index} (generation {generation}) used after free")]
    UseAfterFree { index: usize, generation: u32 },

    /// The worker's buffer pool has no free slots left.
    #[error("buffer pool exhausted")]
    PoolExhausted,

    /// An event loop's poll primitive failed and the loop exited.
    #[error("event loop {name} failed: {source}")]
    LoopFailed {
        name: String,
        #[source]
        source: io::Error,
    },

    /// A loop's task queue is at capacity.
    #[error("task queue for {0} is full")]
    QueueFull(String),

    /// The target loop has already exited.
    #[error("event loop {0} is no longer running")]
    LoopGone(String),

    #[error("server already started")]
    AlreadyStarted,

    /// A `ServerOptions` value cannot be used to start a server.
    #[error("invalid server options: {0}")]
    InvalidOptions(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Build a handler error from anything printable.
    pub fn handler(msg: impl std::fmt::Display) -> Self {
        Error::Handler(msg.to_string())
    }

    /// True for refcount violations, which indicate a handler bug.
    pub fn is_use_after_free(&self) -> bool {
        matches!(self, Error::UseAfterFree { .. })
    }
}
