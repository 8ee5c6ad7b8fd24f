//! Discard handler: reads everything, keeps nothing, never replies.

use crate::error::{Error, Result};
use crate::runtime::{Buffer, Context, Handler};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Counters shared by every `DiscardHandler` they are attached to.
#[derive(Debug, Default)]
pub struct DiscardStats {
    bytes: AtomicU64,
    reads: AtomicU64,
    closed: AtomicU64,
}

impl DiscardStats {
    /// Bytes received and dropped.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }

    /// Buffers received.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Acquire)
    }

    /// Connections that have closed.
    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::Acquire)
    }
}

/// Terminal handler that releases every buffer it receives.
#[derive(Debug, Default)]
pub struct DiscardHandler {
    stats: Option<Arc<DiscardStats>>,
}

impl DiscardHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stats(stats: Arc<DiscardStats>) -> Self {
        Self { stats: Some(stats) }
    }
}

impl Handler for DiscardHandler {
    fn on_data_received(&mut self, ctx: &mut Context<'_>, buf: Buffer) -> Result<()> {
        let len = ctx.bytes(buf).map(|bytes| bytes.len()).unwrap_or(0);
        debug!(
            conn_id = %ctx.channel_id(),
            peer = %ctx.peer_addr(),
            bytes = len,
            "Received data from client"
        );

        if let Some(stats) = &self.stats {
            stats.bytes.fetch_add(len as u64, Ordering::AcqRel);
            stats.reads.fetch_add(1, Ordering::AcqRel);
        }

        ctx.release(buf)?;
        Ok(())
    }

    fn on_error(&mut self, ctx: &mut Context<'_>, cause: &Error) {
        warn!(conn_id = %ctx.channel_id(), error = %cause, "Closing connection after error");
        ctx.close();
    }

    fn on_closed(&mut self, _ctx: &mut Context<'_>) {
        if let Some(stats) = &self.stats {
            stats.closed.fetch_add(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ServerOptions;
    use crate::runtime::PipelineBuilder;
    use crate::server::ServerBootstrap;
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, Shutdown, TcpStream};
    use std::time::{Duration, Instant};

    fn wait_for(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    fn discard_server(stats: &Arc<DiscardStats>) -> (ServerBootstrap, std::net::SocketAddr) {
        let stats = Arc::clone(stats);
        let bootstrap = ServerBootstrap::new(
            ServerOptions::default()
                .with_host_addr(Ipv4Addr::LOCALHOST.into())
                .with_worker_threads(2),
        )
        .child_handler(move |pipeline: &mut PipelineBuilder| -> Result<()> {
            pipeline.add_last(DiscardHandler::with_stats(Arc::clone(&stats)));
            Ok(())
        });
        let addr = bootstrap.start(0).unwrap();
        (bootstrap, addr)
    }

    #[test]
    fn test_discards_bytes_without_reply() {
        let stats = Arc::new(DiscardStats::default());
        let (bootstrap, addr) = discard_server(&stats);

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(&[0u8; 1024]).unwrap();
        client.shutdown(Shutdown::Write).unwrap();

        // Nothing comes back; the server closes after the half-close
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).unwrap();
        assert!(reply.is_empty());

        assert!(wait_for(Duration::from_secs(5), || stats.closed() == 1));
        assert_eq!(stats.bytes(), 1024);
        assert!(stats.reads() >= 1);

        bootstrap.shutdown(Duration::from_secs(1));
        let audit = bootstrap.buffer_stats();
        assert_eq!(audit.allocated, audit.freed);
        assert_eq!(audit.use_after_free, 0);
        assert_eq!(audit.force_released, 0);
    }

    #[test]
    fn test_many_small_writes() {
        let stats = Arc::new(DiscardStats::default());
        let (bootstrap, addr) = discard_server(&stats);

        let mut client = TcpStream::connect(addr).unwrap();
        for _ in 0..50 {
            client.write_all(b"discard me").unwrap();
        }
        drop(client);

        assert!(wait_for(Duration::from_secs(5), || stats.closed() == 1));
        assert_eq!(stats.bytes(), 500);
        bootstrap.shutdown(Duration::from_secs(1));
    }
}
