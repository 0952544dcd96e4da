//! Connection state and the bounded connection registry.
//!
//! Each connection tracks whether it is reading new input or flushing an
//! echo the socket did not accept in one go.

use bytes::{Buf, BytesMut};
use mio::Interest;
use slab::Slab;
use std::io::{self, Write};
use std::net::SocketAddr;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for data to be read.
    Reading,
    /// Echo bytes are still owed to the peer; no reads until they are sent.
    Writing,
}

impl ConnState {
    /// Readiness the connection should be registered for in this state.
    pub fn interest(self) -> Interest {
        match self {
            ConnState::Reading => Interest::READABLE,
            ConnState::Writing => Interest::WRITABLE,
        }
    }
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S> {
    pub stream: S,
    pub peer: SocketAddr,
    state: ConnState,
    pending: BytesMut,
}

impl<S> Connection<S> {
    /// Create a new connection in the reading state.
    pub fn new(stream: S, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Reading,
            pending: BytesMut::new(),
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Bytes still owed to the peer.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Hold `bytes` for a later write and stop reading until they are sent.
    pub fn queue(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.pending.extend_from_slice(bytes);
        self.state = ConnState::Writing;
    }

    /// Record that `n` pending bytes were written.
    ///
    /// Returns to the reading state once nothing is left.
    pub fn consume(&mut self, n: usize) {
        self.pending.advance(n);
        if self.pending.is_empty() {
            self.state = ConnState::Reading;
        }
    }
}

impl<S: Write> Connection<S> {
    /// Offer the pending bytes to the stream in one write call.
    pub fn write_pending(&mut self) -> io::Result<usize> {
        self.stream.write(&self.pending)
    }
}

/// Slots reserved when a registry is created.
const PREALLOCATED: usize = 1024;

/// Registry of active connections using slab allocation.
///
/// Keys of closed connections are reused, which keeps the table compact.
/// The capacity is an admission policy: the slab itself could grow.
pub struct ConnectionRegistry<S> {
    connections: Slab<Connection<S>>,
    max_connections: usize,
}

impl<S> ConnectionRegistry<S> {
    /// Create a new registry admitting at most `max_connections` peers.
    ///
    /// Only the first `PREALLOCATED` slots are reserved up front; the slab
    /// grows past that on demand.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(PREALLOCATED)),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns `None` if the registry is at capacity; the connection is
    /// dropped, which closes its socket.
    pub fn insert(&mut self, conn: Connection<S>) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<Connection<S>> {
        self.connections.try_remove(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }
}
