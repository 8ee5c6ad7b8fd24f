//! Handlers shipped with the server.

mod discard;

pub use discard::{DiscardHandler, DiscardStats};
