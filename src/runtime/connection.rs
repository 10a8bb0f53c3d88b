//! Connection roles and the registration table that holds them.
//!
//! A role (requester or responder) owns its endpoint and codec and drives
//! one exchange. It never touches the poll registry: each handler returns a
//! `Transition` and the dispatcher applies it.

use std::io;

use mio::Interest;
use slab::Slab;
use thiserror::Error;

use crate::protocol::CodecError;
use crate::runtime::endpoint::{EndpointError, Transport};

/// What the dispatcher should do after a read or write handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Keep the current interest.
    Continue,
    /// Switch interest to the given events.
    Reregister(Interest),
    /// The exchange is over; close the connection.
    Close,
}

/// Per-connection failure. Closes that connection only.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("unexpected content: {0}")]
    Protocol(String),

    #[error("registration failed: {0}")]
    Registration(#[from] io::Error),
}

/// Behaviour driving one side of an exchange.
pub trait Role {
    type Stream: Transport;
    /// Value surfaced when the connection closes.
    type Outcome;

    /// Interest to register with when the connection is added.
    fn initial_interest(&self) -> Interest;

    /// Handle write readiness.
    fn on_writable(&mut self) -> Result<Transition, ConnectionError>;

    /// Handle read readiness.
    fn on_readable(&mut self) -> Result<Transition, ConnectionError>;

    /// The socket, while it is still open.
    fn source(&mut self) -> Option<&mut Self::Stream>;

    /// Release the socket. Must be safe to call more than once.
    fn release(&mut self);

    /// Take the outcome, if the exchange produced one.
    fn take_outcome(&mut self) -> Option<Self::Outcome>;
}

/// A registered connection and the interest it is registered with.
#[derive(Debug)]
pub struct Registration<R> {
    pub role: R,
    pub interest: Interest,
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry<R> {
    connections: Slab<Registration<R>>,
    max_connections: usize,
}

impl<R> ConnectionRegistry<R> {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Insert a connection, handing it back if the registry is full.
    pub fn insert(&mut self, registration: Registration<R>) -> Result<usize, Registration<R>> {
        if self.is_full() {
            return Err(registration);
        }
        Ok(self.connections.insert(registration))
    }

    /// Id the next successful `insert` will return.
    pub fn vacant_id(&self) -> usize {
        self.connections.vacant_key()
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Registration<R>> {
        self.connections.get_mut(id)
    }

    /// Remove a connection. Removing twice returns `None`.
    pub fn remove(&mut self, id: usize) -> Option<Registration<R>> {
        self.connections.try_remove(id)
    }

    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    /// Ids of all registered connections.
    pub fn ids(&self) -> Vec<usize> {
        self.connections.iter().map(|(id, _)| id).collect()
    }
}
