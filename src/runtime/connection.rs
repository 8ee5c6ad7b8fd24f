//! Connection state machine for accepted TCP sockets.
//!
//! Each connection tracks its lifecycle state, its pipeline, and the
//! per-channel data handlers can reach through a
//! [`Context`](crate::runtime::Context). A connection is owned and mutated
//! only by the worker loop it was registered with.

use crate::runtime::buffer::Buffer;
use crate::runtime::pipeline::Pipeline;
use crate::runtime::task::{ChannelHandle, ChannelId};
use mio::net::TcpStream;
use slab::Slab;
use std::collections::VecDeque;
use std::net::SocketAddr;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted, not yet assigned to a worker.
    Pending,
    /// Assigned to a worker, pipeline constructed.
    Registered,
    /// Reads are dispatched through the pipeline.
    Open,
    /// Close requested. No new reads; queued writes still flush.
    Closing,
    /// Socket released and pipeline notified.
    Closed,
}

impl ConnState {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: ConnState) -> bool {
        use ConnState::*;
        matches!(
            (self, next),
            (Pending, Registered)
                | (Registered, Open)
                | (Registered, Closing)
                | (Open, Closing)
                | (Closing, Closed)
        )
    }
}

/// Per-channel data handlers can see and mutate during dispatch.
pub(crate) struct Channel {
    pub(crate) id: ChannelId,
    pub(crate) peer: SocketAddr,
    pub(crate) handle: ChannelHandle,
    /// Set by a handler (or the pipeline tail) to request teardown.
    pub(crate) close_requested: bool,
    /// Outbound buffers and how much of the front one is already written.
    pub(crate) outbound: VecDeque<Buffer>,
    pub(crate) written: usize,
}

impl Channel {
    pub(crate) fn new(id: ChannelId, peer: SocketAddr, handle: ChannelHandle) -> Self {
        Self {
            id,
            peer,
            handle,
            close_requested: false,
            outbound: VecDeque::new(),
            written: 0,
        }
    }
}

/// A single client connection.
pub(crate) struct Connection {
    pub(crate) stream: TcpStream,
    state: ConnState,
    pub(crate) channel: Channel,
    pub(crate) pipeline: Pipeline,
    pub(crate) bytes_read: u64,
    /// Whether the socket is currently registered for writable events.
    pub(crate) write_interest: bool,
}

impl Connection {
    /// A connection in the `Pending` state; its worker moves it forward.
    pub(crate) fn new(stream: TcpStream, channel: Channel, pipeline: Pipeline) -> Self {
        Self {
            stream,
            state: ConnState::Pending,
            channel,
            pipeline,
            bytes_read: 0,
            write_interest: false,
        }
    }

    pub(crate) fn state(&self) -> ConnState {
        self.state
    }

    /// Move to `next`, returning `false` if the transition is illegal.
    pub(crate) fn transition(&mut self, next: ConnState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    pub(crate) fn is_closing(&self) -> bool {
        matches!(self.state, ConnState::Closing)
    }

    pub(crate) fn has_pending_writes(&self) -> bool {
        !self.channel.outbound.is_empty()
    }
}

/// Registry of a worker's connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub(crate) struct ConnectionRegistry<C> {
    connections: Slab<C>,
    max_connections: usize,
}

impl<C> ConnectionRegistry<C> {
    /// Create a new registry with specified maximum capacity.
    pub(crate) fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Slot the next insert will use, or `None` if the registry is full.
    pub(crate) fn vacant_key(&self) -> Option<usize> {
        if self.connections.len() >= self.max_connections {
            None
        } else {
            Some(self.connections.vacant_key())
        }
    }

    /// Insert a new connection, handing it back if the registry is at
    /// capacity.
    pub(crate) fn insert(&mut self, conn: C) -> Result<usize, C> {
        if self.connections.len() >= self.max_connections {
            return Err(conn);
        }
        Ok(self.connections.insert(conn))
    }

    pub(crate) fn get_mut(&mut self, id: usize) -> Option<&mut C> {
        self.connections.get_mut(id)
    }

    pub(crate) fn remove(&mut self, id: usize) -> Option<C> {
        self.connections.try_remove(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.connections.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Keys of all live connections.
    pub(crate) fn keys(&self) -> Vec<usize> {
        self.connections.iter().map(|(key, _)| key).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_transitions() {
        use ConnState::*;

        assert!(Pending.can_transition_to(Registered));
        assert!(Registered.can_transition_to(Open));
        assert!(Open.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));

        // Closing may be requested before the connection ever opened
        assert!(Registered.can_transition_to(Closing));

        assert!(!Open.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Open));
        assert!(!Closing.can_transition_to(Open));
        assert!(!Closed.can_transition_to(Closing));
        assert!(!Pending.can_transition_to(Open));
    }

    #[test]
    fn test_connection_registry() {
        let mut registry = ConnectionRegistry::new(2);

        assert_eq!(registry.vacant_key(), Some(0));
        let id1 = registry.insert("a").unwrap();
        let id2 = registry.insert("b").unwrap();

        // At capacity
        assert!(registry.vacant_key().is_none());
        assert_eq!(registry.insert("c"), Err("c"));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get_mut(id1), Some(&mut "a"));
        assert_eq!(registry.get_mut(id2), Some(&mut "b"));

        assert_eq!(registry.remove(id1), Some("a"));
        assert!(registry.get_mut(id1).is_none());
        assert!(registry.remove(id1).is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.keys(), vec![id2]);

        // Freed slot is reused
        assert_eq!(registry.vacant_key(), Some(id1));
        *registry.get_mut(id2).unwrap() = "d";
        assert_eq!(registry.get_mut(id2), Some(&mut "d"));
        registry.remove(id2);
        assert!(registry.is_empty());
    }
}
