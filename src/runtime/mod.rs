//! Event-loop runtime.
//!
//! Thread-per-loop scaffolding on top of mio:
//! - `BufferPool`: per-worker arena of reference-counted buffers
//! - `Pipeline`: per-connection chain of handlers
//! - `Connection`: connection state machine
//! - task queues: the only way other threads talk to a loop

mod buffer;
mod connection;
pub(crate) mod mio;
mod pipeline;
pub(crate) mod task;

pub use buffer::{Buffer, BufferPool, BufferStats, BufferStatsSnapshot};
pub use connection::ConnState;
pub use pipeline::{Context, Handler, Pipeline, PipelineBuilder, PipelineFactory};
pub use task::{ChannelHandle, ChannelId};
