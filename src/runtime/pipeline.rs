//! Per-connection handler pipeline.
//!
//! A [`Pipeline`] is an ordered chain of [`Handler`]s built once per
//! connection by a [`PipelineFactory`] and fixed afterwards. Events enter at
//! the head; each handler decides whether to pass them on through its
//! [`Context`].
//!
//! ## Delivery rules
//!
//! - `data received` propagates only as far as handlers forward it. A buffer
//!   that falls off the end is released by the tail.
//! - `error` propagates the same way. If it reaches the tail the connection
//!   is closed; if a handler swallows it without closing, the worker closes
//!   the connection anyway.
//! - `closed` is delivered to every handler, in order, exactly once.
//!
//! A handler that returns `Err` or panics during `on_data_received` is
//! turned into an `on_error` event. Panics never unwind into the event loop.

use crate::error::{Error, Result};
use crate::runtime::buffer::{Buffer, BufferPool};
use crate::runtime::connection::Channel;
use crate::runtime::task::{ChannelHandle, ChannelId};
use std::any::Any;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, error, warn};

/// Per-connection event callbacks.
///
/// Handlers are created on the worker thread that owns the connection and
/// never leave it, so they need not be `Send`.
pub trait Handler: 'static {
    /// Bytes arrived. The handler owns one reference to `buf` and must either
    /// forward it with [`Context::fire_data_received`] or release it.
    fn on_data_received(&mut self, ctx: &mut Context<'_>, buf: Buffer) -> Result<()>;

    /// An error was raised on the connection. Forwards by default.
    fn on_error(&mut self, ctx: &mut Context<'_>, cause: &Error) {
        ctx.fire_error(cause);
    }

    /// The connection is closed. Called once, for every handler.
    fn on_closed(&mut self, ctx: &mut Context<'_>) {
        let _ = ctx;
    }
}

/// Handler's view of its connection during one event.
pub struct Context<'a> {
    /// Handlers after the current one.
    rest: &'a mut [Box<dyn Handler>],
    channel: &'a mut Channel,
    pool: &'a mut BufferPool,
}

impl<'a> Context<'a> {
    /// Pass `buf` to the next handler.
    pub fn fire_data_received(&mut self, buf: Buffer) -> Result<()> {
        match self.rest.split_first_mut() {
            Some((next, rest)) => {
                let mut ctx = Context {
                    rest,
                    channel: &mut *self.channel,
                    pool: &mut *self.pool,
                };
                next.on_data_received(&mut ctx, buf)
            }
            None => {
                debug!(
                    conn_id = %self.channel.id,
                    "Buffer reached the end of the pipeline, releasing"
                );
                self.pool.release(buf).map(|_| ())
            }
        }
    }

    /// Pass `cause` to the next handler. At the tail, the connection closes.
    pub fn fire_error(&mut self, cause: &Error) {
        match self.rest.split_first_mut() {
            Some((next, rest)) => {
                let mut ctx = Context {
                    rest,
                    channel: &mut *self.channel,
                    pool: &mut *self.pool,
                };
                next.on_error(&mut ctx, cause);
            }
            None => {
                warn!(
                    conn_id = %self.channel.id,
                    error = %cause,
                    "Unhandled error reached the end of the pipeline, closing"
                );
                self.channel.close_requested = true;
            }
        }
    }

    /// Bytes held by `buf`.
    pub fn bytes(&self, buf: Buffer) -> Result<&[u8]> {
        self.pool.get(buf)
    }

    /// Add a reference to `buf`.
    pub fn retain(&mut self, buf: Buffer) -> Result<Buffer> {
        self.pool.retain(buf)
    }

    /// Drop a reference to `buf`. Returns `true` if that freed it.
    pub fn release(&mut self, buf: Buffer) -> Result<bool> {
        self.pool.release(buf)
    }

    /// Allocate an outbound buffer holding a copy of `bytes`.
    pub fn alloc(&mut self, bytes: &[u8]) -> Result<Buffer> {
        self.pool.alloc_from(Some(self.channel.id.serial), bytes)
    }

    /// Queue `buf` for writing. Ownership of one reference moves to the
    /// connection, which releases it once flushed or at teardown.
    pub fn write(&mut self, buf: Buffer) -> Result<()> {
        self.pool.get(buf)?;
        self.channel.outbound.push_back(buf);
        Ok(())
    }

    /// Request a graceful close. Idempotent.
    pub fn close(&mut self) {
        self.channel.close_requested = true;
    }

    pub fn is_close_requested(&self) -> bool {
        self.channel.close_requested
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.channel.peer
    }

    /// Handle that lets other threads close this connection.
    pub fn handle(&self) -> ChannelHandle {
        self.channel.handle.clone()
    }
}

/// Ordered chain of handlers for one connection.
pub struct Pipeline {
    handlers: Vec<Box<dyn Handler>>,
}

impl Pipeline {
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Deliver `buf` to the head of the chain.
    ///
    /// Errors and panics from handlers come back as `Err`; the caller turns
    /// them into an error event.
    pub(crate) fn fire_data_received(
        &mut self,
        channel: &mut Channel,
        pool: &mut BufferPool,
        buf: Buffer,
    ) -> Result<()> {
        let mut ctx = Context {
            rest: &mut self.handlers[..],
            channel,
            pool,
        };
        catch_unwind(AssertUnwindSafe(|| ctx.fire_data_received(buf)))
            .unwrap_or_else(|panic| Err(Error::handler(panic_message(&*panic))))
    }

    /// Deliver `cause` to the head of the chain.
    ///
    /// A handler panicking here closes the connection.
    pub(crate) fn fire_error(&mut self, channel: &mut Channel, pool: &mut BufferPool, cause: &Error) {
        let mut ctx = Context {
            rest: &mut self.handlers[..],
            channel,
            pool,
        };
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| ctx.fire_error(cause))) {
            error!(
                conn_id = %ctx.channel.id,
                panic = %panic_message(&*panic),
                "Handler panicked while handling an error"
            );
            ctx.channel.close_requested = true;
        }
    }

    /// Notify every handler that the connection is gone.
    pub(crate) fn fire_closed(&mut self, channel: &mut Channel, pool: &mut BufferPool) {
        for index in 0..self.handlers.len() {
            let Some((current, rest)) = self.handlers[index..].split_first_mut() else {
                break;
            };
            let mut ctx = Context {
                rest,
                channel: &mut *channel,
                pool: &mut *pool,
            };
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| current.on_closed(&mut ctx))) {
                error!(
                    conn_id = %channel.id,
                    panic = %panic_message(&*panic),
                    "Handler panicked in on_closed"
                );
            }
        }
    }
}

/// Collects handlers while a connection's pipeline is being built.
pub struct PipelineBuilder {
    handlers: Vec<Box<dyn Handler>>,
    id: ChannelId,
    peer: SocketAddr,
}

impl PipelineBuilder {
    pub(crate) fn new(id: ChannelId, peer: SocketAddr) -> Self {
        Self {
            handlers: Vec::new(),
            id,
            peer,
        }
    }

    /// Append a handler to the end of the chain.
    pub fn add_last(&mut self, handler: impl Handler) -> &mut Self {
        self.handlers.push(Box::new(handler));
        self
    }

    pub fn channel_id(&self) -> ChannelId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn build(self) -> Pipeline {
        Pipeline {
            handlers: self.handlers,
        }
    }
}

/// Builds the pipeline of every accepted connection.
///
/// Invoked once per connection, on the worker thread that owns it.
pub trait PipelineFactory: Send + Sync + 'static {
    fn init_pipeline(&self, pipeline: &mut PipelineBuilder) -> Result<()>;
}

impl<F> PipelineFactory for F
where
    F: Fn(&mut PipelineBuilder) -> Result<()> + Send + Sync + 'static,
{
    fn init_pipeline(&self, pipeline: &mut PipelineBuilder) -> Result<()> {
        self(pipeline)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::task::{task_queue, WorkerTask, WAKER_TOKEN};
    use mio::{Poll, Waker};
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    type Log = Rc<RefCell<Vec<String>>>;

    /// Records events, then forwards or releases.
    struct Recorder {
        name: &'static str,
        log: Log,
        forward: bool,
    }

    impl Handler for Recorder {
        fn on_data_received(&mut self, ctx: &mut Context<'_>, buf: Buffer) -> Result<()> {
            let len = ctx.bytes(buf)?.len();
            self.log.borrow_mut().push(format!("{}:data:{}", self.name, len));
            if self.forward {
                ctx.fire_data_received(buf)
            } else {
                ctx.release(buf).map(|_| ())
            }
        }

        fn on_error(&mut self, ctx: &mut Context<'_>, cause: &Error) {
            self.log.borrow_mut().push(format!("{}:error", self.name));
            if self.forward {
                ctx.fire_error(cause);
            }
        }

        fn on_closed(&mut self, _ctx: &mut Context<'_>) {
            self.log.borrow_mut().push(format!("{}:closed", self.name));
        }
    }

    struct Failing;

    impl Handler for Failing {
        fn on_data_received(&mut self, _ctx: &mut Context<'_>, _buf: Buffer) -> Result<()> {
            Err(Error::handler("bad input"))
        }
    }

    struct Panicking;

    impl Handler for Panicking {
        fn on_data_received(&mut self, _ctx: &mut Context<'_>, _buf: Buffer) -> Result<()> {
            panic!("boom");
        }
    }

    fn test_channel() -> (Channel, Poll) {
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).unwrap());
        let (worker, _rx) = task_queue::<WorkerTask>("worker-0", 4, waker);
        let id = ChannelId {
            worker: 0,
            slot: 0,
            serial: 1,
        };
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        (Channel::new(id, peer, ChannelHandle::new(id, worker)), poll)
    }

    fn recorder(name: &'static str, log: &Log, forward: bool) -> Recorder {
        Recorder {
            name,
            log: Rc::clone(log),
            forward,
        }
    }

    #[test]
    fn test_data_stops_where_handler_stops_forwarding() {
        let log = Log::default();
        let (mut channel, _poll) = test_channel();
        let mut pool = BufferPool::new(4, 64);

        let mut builder = PipelineBuilder::new(channel.id, channel.peer);
        builder
            .add_last(recorder("a", &log, true))
            .add_last(recorder("b", &log, false))
            .add_last(recorder("c", &log, true));
        let mut pipeline = builder.build();
        assert_eq!(pipeline.len(), 3);

        let buf = pool.alloc_from(Some(1), b"12345").unwrap();
        pipeline
            .fire_data_received(&mut channel, &mut pool, buf)
            .unwrap();

        assert_eq!(*log.borrow(), vec!["a:data:5", "b:data:5"]);
        assert_eq!(pool.live(), 0);
    }

    #[test]
    fn test_tail_releases_unhandled_buffer() {
        let log = Log::default();
        let (mut channel, _poll) = test_channel();
        let mut pool = BufferPool::new(4, 64);

        let mut builder = PipelineBuilder::new(channel.id, channel.peer);
        builder.add_last(recorder("a", &log, true));
        let mut pipeline = builder.build();

        let buf = pool.alloc_from(Some(1), b"xy").unwrap();
        pipeline
            .fire_data_received(&mut channel, &mut pool, buf)
            .unwrap();
        assert_eq!(pool.live(), 0);
        assert_eq!(pool.stats().snapshot().freed, 1);
    }

    #[test]
    fn test_error_reaching_tail_requests_close() {
        let log = Log::default();
        let (mut channel, _poll) = test_channel();
        let mut pool = BufferPool::new(4, 64);

        let mut builder = PipelineBuilder::new(channel.id, channel.peer);
        builder.add_last(recorder("a", &log, true));
        let mut pipeline = builder.build();

        pipeline.fire_error(&mut channel, &mut pool, &Error::handler("x"));
        assert!(channel.close_requested);
        assert_eq!(*log.borrow(), vec!["a:error"]);
    }

    #[test]
    fn test_swallowed_error_does_not_close() {
        let log = Log::default();
        let (mut channel, _poll) = test_channel();
        let mut pool = BufferPool::new(4, 64);

        let mut builder = PipelineBuilder::new(channel.id, channel.peer);
        builder.add_last(recorder("a", &log, false));
        let mut pipeline = builder.build();

        pipeline.fire_error(&mut channel, &mut pool, &Error::handler("x"));
        // The worker applies the terminal cleanup in this case
        assert!(!channel.close_requested);
    }

    #[test]
    fn test_closed_reaches_every_handler() {
        let log = Log::default();
        let (mut channel, _poll) = test_channel();
        let mut pool = BufferPool::new(4, 64);

        let mut builder = PipelineBuilder::new(channel.id, channel.peer);
        builder
            .add_last(recorder("a", &log, false))
            .add_last(recorder("b", &log, false));
        let mut pipeline = builder.build();

        pipeline.fire_closed(&mut channel, &mut pool);
        assert_eq!(*log.borrow(), vec!["a:closed", "b:closed"]);
    }

    #[test]
    fn test_handler_error_is_returned() {
        let (mut channel, _poll) = test_channel();
        let mut pool = BufferPool::new(4, 64);

        let mut builder = PipelineBuilder::new(channel.id, channel.peer);
        builder.add_last(Failing);
        let mut pipeline = builder.build();

        let buf = pool.alloc(Some(1)).unwrap();
        let err = pipeline
            .fire_data_received(&mut channel, &mut pool, buf)
            .unwrap_err();
        assert!(matches!(err, Error::Handler(msg) if msg == "bad input"));

        // The handler leaked its buffer; teardown reclaims it
        assert_eq!(pool.force_release_owned_by(1), 1);
    }

    #[test]
    fn test_handler_panic_is_caught() {
        let (mut channel, _poll) = test_channel();
        let mut pool = BufferPool::new(4, 64);

        let mut builder = PipelineBuilder::new(channel.id, channel.peer);
        builder.add_last(Panicking);
        let mut pipeline = builder.build();

        let buf = pool.alloc(Some(1)).unwrap();
        let err = pipeline
            .fire_data_received(&mut channel, &mut pool, buf)
            .unwrap_err();
        assert!(matches!(err, Error::Handler(msg) if msg == "boom"));
    }

    #[test]
    fn test_write_queues_outbound_buffer() {
        struct Echo;
        impl Handler for Echo {
            fn on_data_received(&mut self, ctx: &mut Context<'_>, buf: Buffer) -> Result<()> {
                ctx.write(buf)
            }
        }

        let (mut channel, _poll) = test_channel();
        let mut pool = BufferPool::new(4, 64);

        let mut builder = PipelineBuilder::new(channel.id, channel.peer);
        builder.add_last(Echo);
        let mut pipeline = builder.build();

        let buf = pool.alloc_from(Some(1), b"ping").unwrap();
        pipeline
            .fire_data_received(&mut channel, &mut pool, buf)
            .unwrap();
        assert_eq!(channel.outbound.len(), 1);
        assert_eq!(pool.ref_count(buf), Some(1));
    }

    #[test]
    fn test_factory_closure() {
        let factory = |pipeline: &mut PipelineBuilder| -> Result<()> {
            pipeline.add_last(Failing);
            Ok(())
        };
        let id = ChannelId {
            worker: 0,
            slot: 3,
            serial: 9,
        };
        let mut builder = PipelineBuilder::new(id, "127.0.0.1:1".parse().unwrap());
        factory.init_pipeline(&mut builder).unwrap();
        assert_eq!(builder.channel_id(), id);
        assert_eq!(builder.build().len(), 1);
    }
}
