//! Server options.
//!
//! Everything the bootstrap needs to bind, size and tune its loops. Built
//! with named methods:
//!
//! ```
//! use discard_server::ServerOptions;
//! use std::net::Ipv4Addr;
//!
//! let options = ServerOptions::default()
//!     .with_host_addr(Ipv4Addr::LOCALHOST.into())
//!     .with_worker_threads(4)
//!     .with_backlog(256);
//! assert!(options.validate().is_ok());
//! ```

use crate::error::{Error, Result};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Port used when none is given on the command line.
pub const DEFAULT_PORT: u16 = 8080;

/// How long `shutdown` waits for connections to close gracefully when the
/// bootstrap is dropped.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How acceptors pick the worker for a new connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionPolicy {
    /// Cycle through workers in order.
    #[default]
    RoundRobin,
    /// Worker with the fewest live connections; ties go to the lowest index.
    LeastLoaded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerOptions {
    pub host: IpAddr,
    pub acceptor_threads: usize,
    pub worker_threads: usize,
    pub backlog: u32,
    /// `SO_KEEPALIVE` on accepted sockets.
    pub keep_alive: bool,
    /// `TCP_NODELAY` on accepted sockets.
    pub no_delay: bool,
    pub selection: SelectionPolicy,
    /// Bytes read from a socket per buffer.
    pub read_buffer_size: usize,
    pub max_buffers_per_worker: usize,
    pub max_connections_per_worker: usize,
    /// Capacity of each loop's task queue.
    pub task_queue_capacity: usize,
    /// Readiness events handled per poll.
    pub events_capacity: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            acceptor_threads: 1,
            worker_threads: default_worker_threads(),
            backlog: 128,
            keep_alive: true,
            no_delay: true,
            selection: SelectionPolicy::RoundRobin,
            read_buffer_size: 8 * 1024,
            max_buffers_per_worker: 4096,
            max_connections_per_worker: 10_000,
            task_queue_capacity: 1024,
            events_capacity: 1024,
        }
    }
}

/// One worker per core.
pub fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl ServerOptions {
    /// Set the bind address. Parsing text into an address is left to the
    /// caller, so a bad host is reported where it was typed.
    pub fn with_host_addr(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    pub fn with_acceptor_threads(mut self, threads: usize) -> Self {
        self.acceptor_threads = threads;
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    pub fn with_selection(mut self, selection: SelectionPolicy) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn with_max_buffers_per_worker(mut self, max: usize) -> Self {
        self.max_buffers_per_worker = max;
        self
    }

    pub fn with_max_connections_per_worker(mut self, max: usize) -> Self {
        self.max_connections_per_worker = max;
        self
    }

    pub fn with_task_queue_capacity(mut self, capacity: usize) -> Self {
        self.task_queue_capacity = capacity;
        self
    }

    pub fn with_events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = capacity;
        self
    }

    /// Address to bind for `port`.
    pub fn bind_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.host, port)
    }

    /// Reject values no server can run with.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.acceptor_threads, "acceptor_threads"),
            (self.worker_threads, "worker_threads"),
            (self.read_buffer_size, "read_buffer_size"),
            (self.max_buffers_per_worker, "max_buffers_per_worker"),
            (self.max_connections_per_worker, "max_connections_per_worker"),
            (self.task_queue_capacity, "task_queue_capacity"),
            (self.events_capacity, "events_capacity"),
        ];
        for (value, name) in checks {
            if value == 0 {
                return Err(Error::InvalidOptions(format!("{name} must be at least 1")));
            }
        }
        if self.backlog == 0 {
            return Err(Error::InvalidOptions("backlog must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test]
    fn test_defaults() {
        let options = ServerOptions::default();
        assert_eq!(options.host, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(options.acceptor_threads, 1);
        assert!(options.worker_threads >= 1);
        assert_eq!(options.backlog, 128);
        assert!(options.keep_alive);
        assert!(options.no_delay);
        assert_eq!(options.selection, SelectionPolicy::RoundRobin);
        assert_eq!(options.read_buffer_size, 8192);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let options = ServerOptions::default()
            .with_host_addr(Ipv4Addr::LOCALHOST.into())
            .with_acceptor_threads(2)
            .with_worker_threads(3)
            .with_keep_alive(false)
            .with_selection(SelectionPolicy::LeastLoaded);

        assert_eq!(options.bind_addr(9000), "127.0.0.1:9000".parse().unwrap());
        assert_eq!(options.acceptor_threads, 2);
        assert_eq!(options.worker_threads, 3);
        assert!(!options.keep_alive);
        assert_eq!(options.selection, SelectionPolicy::LeastLoaded);
    }

    #[test]
    fn test_host_addr_accepts_ipv6() {
        let options = ServerOptions::default().with_host_addr(Ipv6Addr::LOCALHOST.into());
        assert_eq!(options.bind_addr(9000), "[::1]:9000".parse().unwrap());
    }

    #[test]
    fn test_validate_rejects_zero() {
        let err = ServerOptions::default()
            .with_worker_threads(0)
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(msg) if msg.contains("worker_threads")));

        assert!(ServerOptions::default().with_backlog(0).validate().is_err());
        assert!(ServerOptions::default()
            .with_read_buffer_size(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_selection_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            selection: SelectionPolicy,
        }
        let parsed: Wrapper = toml::from_str(r#"selection = "least-loaded""#).unwrap();
        assert_eq!(parsed.selection, SelectionPolicy::LeastLoaded);
        let parsed: Wrapper = toml::from_str(r#"selection = "round-robin""#).unwrap();
        assert_eq!(parsed.selection, SelectionPolicy::RoundRobin);
    }
}
