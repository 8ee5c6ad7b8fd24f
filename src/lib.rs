//! discard-server: an event-driven TCP discard server.
//!
//! Acceptor loops accept connections and hand them to a fixed group of
//! worker loops. Each connection gets its own pipeline of handlers, built by
//! a factory on the worker that owns it. Bytes are read into pooled,
//! reference-counted buffers and pushed through the pipeline.
//!
//! The shipped [`DiscardHandler`] releases everything it receives.

pub mod config;
pub mod error;
pub mod handlers;
pub mod options;
pub mod runtime;
pub mod server;

pub use error::{Error, Result};
pub use handlers::{DiscardHandler, DiscardStats};
pub use options::{SelectionPolicy, ServerOptions, DEFAULT_PORT, DEFAULT_SHUTDOWN_TIMEOUT};
pub use runtime::{
    Buffer, BufferPool, BufferStats, BufferStatsSnapshot, ChannelHandle, ChannelId, ConnState,
    Context, Handler, Pipeline, PipelineBuilder, PipelineFactory,
};
pub use server::ServerBootstrap;
