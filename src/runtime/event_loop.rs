//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then the connection's role performs non-blocking reads and writes.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! The dispatcher owns the registration table exclusively. Roles report
//! interest changes and completion through `Transition` values; any error
//! a role returns closes that one connection and the loop carries on.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, error, info, warn};

use crate::runtime::connection::{
    ConnectionError, ConnectionRegistry, Registration, Role, Transition,
};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Default capacity of the readiness event batch.
pub const EVENTS_CAPACITY: usize = 256;

/// Counters kept by a dispatcher.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    /// Connections accepted from the listener and registered.
    pub accepted: u64,
    /// Peers accepted from the listener but turned away.
    pub rejected: u64,
    /// Connections that finished their exchange.
    pub completed: u64,
    /// Connections closed because of an error.
    pub failed: u64,
}

/// Builds the role for a newly accepted connection.
type Acceptor<R> = Box<dyn FnMut(TcpStream, SocketAddr) -> R>;

struct Listener<R> {
    socket: TcpListener,
    acceptor: Acceptor<R>,
}

/// Readiness of one connection in the current batch.
#[derive(Debug, Clone, Copy)]
struct Readiness {
    token: Token,
    readable: bool,
    writable: bool,
}

/// Single-threaded reactor multiplexing connections of one role type.
pub struct Dispatcher<R: Role> {
    poll: Poll,
    events: Events,
    registry: ConnectionRegistry<R>,
    listener: Option<Listener<R>>,
    outcomes: Vec<R::Outcome>,
    stats: DispatchStats,
}

impl<R> Dispatcher<R>
where
    R: Role,
    R::Stream: Source,
{
    pub fn new(max_connections: usize, events_capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(events_capacity),
            registry: ConnectionRegistry::new(max_connections),
            listener: None,
            outcomes: Vec::new(),
            stats: DispatchStats::default(),
        })
    }

    /// Register a listening socket; accepted peers get a role from `acceptor`.
    pub fn listen(
        &mut self,
        mut socket: TcpListener,
        acceptor: impl FnMut(TcpStream, SocketAddr) -> R + 'static,
    ) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut socket, LISTENER_TOKEN, Interest::READABLE)?;
        self.listener = Some(Listener {
            socket,
            acceptor: Box::new(acceptor),
        });
        Ok(())
    }

    /// Add a connection with its role's initial interest.
    ///
    /// The socket is registered with the poll under the slot it will
    /// occupy before the role enters the table. On failure the role is
    /// released before the error is returned.
    pub fn register(&mut self, mut role: R) -> io::Result<usize> {
        if self.registry.is_full() {
            role.release();
            return Err(io::Error::other("connection limit reached"));
        }

        let conn_id = self.registry.vacant_id();
        let interest = role.initial_interest();
        let registered = match role.source() {
            Some(stream) => self
                .poll
                .registry()
                .register(stream, Token(conn_id), interest),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "endpoint already released",
            )),
        };
        if let Err(e) = registered {
            role.release();
            return Err(e);
        }

        match self.registry.insert(Registration { role, interest }) {
            Ok(inserted) if inserted == conn_id => Ok(conn_id),
            Ok(inserted) => {
                self.close_connection(inserted);
                Err(io::Error::other("registration slot changed"))
            }
            Err(mut rejected) => {
                if let Some(stream) = rejected.role.source() {
                    if let Err(e) = self.poll.registry().deregister(stream) {
                        warn!(conn_id, error = %e, "Failed to deregister connection");
                    }
                }
                rejected.role.release();
                Err(io::Error::other("connection limit reached"))
            }
        }
    }

    /// Wait once for readiness and dispatch every ready connection.
    ///
    /// Returns the number of events handled. A wait interrupted by a
    /// signal handles nothing and returns zero.
    pub fn turn(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e),
        }

        let ready: Vec<Readiness> = self
            .events
            .iter()
            .map(|event| Readiness {
                token: event.token(),
                readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                writable: event.is_writable() || event.is_write_closed(),
            })
            .collect();

        for readiness in &ready {
            if readiness.token == LISTENER_TOKEN {
                self.accept_connections();
                continue;
            }

            let conn_id = readiness.token.0;
            if let Err(e) = self.dispatch(conn_id, readiness) {
                debug!(conn_id, error = %e, "Connection error");
                self.stats.failed += 1;
                self.close_connection(conn_id);
            }
        }

        Ok(ready.len())
    }

    /// Run until no connections remain, or until `stop` is set.
    pub fn run_until_idle(
        &mut self,
        timeout: Option<Duration>,
        stop: &AtomicBool,
    ) -> io::Result<()> {
        while !self.registry.is_empty() {
            if stop.load(Ordering::Relaxed) {
                info!("Interrupt received, exiting");
                break;
            }
            self.turn(timeout)?;
        }
        Ok(())
    }

    /// Run until `stop` is set.
    pub fn run_forever(&mut self, timeout: Option<Duration>, stop: &AtomicBool) -> io::Result<()> {
        while !stop.load(Ordering::Relaxed) {
            self.turn(timeout)?;
        }
        info!("Interrupt received, exiting");
        Ok(())
    }

    /// Close every connection and the listener.
    pub fn shutdown(&mut self) {
        for conn_id in self.registry.ids() {
            self.close_connection(conn_id);
        }
        if let Some(mut listener) = self.listener.take() {
            if let Err(e) = self.poll.registry().deregister(&mut listener.socket) {
                warn!(error = %e, "Failed to deregister listener");
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Count a connection that failed before it could be registered.
    pub fn record_failure(&mut self) {
        self.stats.failed += 1;
    }

    /// Outcomes of closed connections, in close order.
    pub fn take_outcomes(&mut self) -> Vec<R::Outcome> {
        std::mem::take(&mut self.outcomes)
    }

    /// Local address of the listener, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener
            .as_ref()
            .and_then(|listener| listener.socket.local_addr().ok())
    }

    fn accept_connections(&mut self) {
        loop {
            let Some(listener) = self.listener.as_mut() else {
                return;
            };

            match listener.socket.accept() {
                Ok((stream, peer)) => {
                    let role = (listener.acceptor)(stream, peer);
                    match self.register(role) {
                        Ok(conn_id) => {
                            self.stats.accepted += 1;
                            debug!(conn_id, peer = %peer, "Accepted connection");
                        }
                        Err(e) => {
                            self.stats.rejected += 1;
                            warn!(peer = %peer, error = %e, "Rejected connection");
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Accept error: {}", e);
                    break;
                }
            }
        }
    }

    /// Write before read, so a role that writes then expects input has
    /// already switched interest by the time it reads.
    fn dispatch(&mut self, conn_id: usize, readiness: &Readiness) -> Result<(), ConnectionError> {
        if readiness.writable {
            let Some(registration) = self.registry.get_mut(conn_id) else {
                return Ok(());
            };
            let transition = registration.role.on_writable()?;
            self.apply(conn_id, transition)?;
        }

        if readiness.readable {
            // May have been closed by the write pass
            let Some(registration) = self.registry.get_mut(conn_id) else {
                return Ok(());
            };
            let transition = registration.role.on_readable()?;
            self.apply(conn_id, transition)?;
        }

        Ok(())
    }

    fn apply(&mut self, conn_id: usize, transition: Transition) -> Result<(), ConnectionError> {
        match transition {
            Transition::Continue => {}
            Transition::Reregister(interest) => {
                let Some(registration) = self.registry.get_mut(conn_id) else {
                    return Ok(());
                };
                if registration.interest != interest {
                    if let Some(stream) = registration.role.source() {
                        self.poll
                            .registry()
                            .reregister(stream, Token(conn_id), interest)?;
                    }
                    registration.interest = interest;
                }
            }
            Transition::Close => {
                self.stats.completed += 1;
                self.close_connection(conn_id);
            }
        }
        Ok(())
    }

    /// Deregister, then release. Closing an unknown id does nothing.
    fn close_connection(&mut self, conn_id: usize) {
        let Some(mut registration) = self.registry.remove(conn_id) else {
            return;
        };

        if let Some(stream) = registration.role.source() {
            if let Err(e) = self.poll.registry().deregister(stream) {
                warn!(conn_id, error = %e, "Failed to deregister connection");
            }
        }
        registration.role.release();

        if let Some(outcome) = registration.role.take_outcome() {
            self.outcomes.push(outcome);
        }
        debug!(conn_id, "Connection closed");
    }
}

/// Create a non-blocking TCP listener with SO_REUSEADDR set.
pub fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(TcpListener::from_std(socket.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ActionTable, Outgoing, Reply};
    use crate::runtime::endpoint::Endpoint;
    use crate::runtime::requester::Requester;
    use crate::runtime::responder::Responder;
    use bytes::Bytes;
    use serde_json::json;
    use std::io::Write;
    use std::rc::Rc;

    const TICK: Option<Duration> = Some(Duration::from_millis(10));
    const MAX_TURNS: usize = 500;

    fn server() -> Dispatcher<Responder<TcpStream>> {
        server_with_limit(16)
    }

    fn server_with_limit(max_connections: usize) -> Dispatcher<Responder<TcpStream>> {
        let mut dispatcher = Dispatcher::new(max_connections, EVENTS_CAPACITY).unwrap();
        let listener = create_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let actions = Rc::new(ActionTable::default());
        dispatcher
            .listen(listener, move |stream, peer| {
                Responder::new(Endpoint::new(stream, peer.to_string()), Rc::clone(&actions))
            })
            .unwrap();
        dispatcher
    }

    fn client(addr: SocketAddr, requests: &[Outgoing]) -> Dispatcher<Requester<TcpStream>> {
        let mut dispatcher = Dispatcher::new(16, EVENTS_CAPACITY).unwrap();
        for request in requests {
            let stream = TcpStream::connect(addr).unwrap();
            let requester = Requester::new(Endpoint::new(stream, addr.to_string()), request.clone());
            dispatcher.register(requester).unwrap();
        }
        dispatcher
    }

    /// Alternate server and client turns until every request completes.
    fn exchange(requests: &[Outgoing]) -> (Vec<Reply>, DispatchStats, DispatchStats) {
        let mut server = server();
        let mut client = client(server.local_addr().unwrap(), requests);

        for _ in 0..MAX_TURNS {
            if client.connection_count() == 0 && server.connection_count() == 0 {
                break;
            }
            server.turn(TICK).unwrap();
            client.turn(TICK).unwrap();
        }

        assert_eq!(client.connection_count(), 0, "client did not finish");
        (client.take_outcomes(), client.stats(), server.stats())
    }

    #[test]
    fn test_structured_exchange() {
        let (replies, client_stats, server_stats) =
            exchange(&[Outgoing::request("search", "morpheus").unwrap()]);

        assert_eq!(replies, vec![Reply::Result(json!("Follow the white rabbit. 🐰"))]);
        assert_eq!(client_stats.completed, 1);
        assert_eq!(client_stats.failed, 0);
        assert_eq!(server_stats.accepted, 1);
        assert_eq!(server_stats.completed, 1);
    }

    #[test]
    fn test_unmatched_query_exchange() {
        let (replies, _, _) = exchange(&[Outgoing::request("search", "unknown").unwrap()]);
        assert_eq!(replies, vec![Reply::Result(json!("No match for 'unknown'."))]);
    }

    #[test]
    fn test_binary_exchange() {
        let (replies, _, _) = exchange(&[Outgoing::request("HELLO", "WORLDXYZ").unwrap()]);
        assert_eq!(
            replies,
            vec![Reply::Binary {
                content_type: "binary/custom-server-binary-type".to_string(),
                payload: Bytes::from_static(b"First 10 bytes of request: HELLOWORLD"),
            }]
        );
    }

    #[test]
    fn test_many_connections_one_thread() {
        let requests: Vec<Outgoing> = ["morpheus", "ring", "unknown", "🐶"]
            .iter()
            .map(|value| Outgoing::request("search", value).unwrap())
            .collect();

        let (replies, client_stats, server_stats) = exchange(&requests);
        assert_eq!(replies.len(), 4);
        assert_eq!(client_stats.completed, 4);
        assert_eq!(server_stats.accepted, 4);
        assert!(replies.contains(&Reply::Result(json!("🐾 Playing ball! 🏐"))));
    }

    #[test]
    fn test_large_payload_exchange() {
        let value = "x".repeat(200_000);
        let (replies, _, _) = exchange(&[Outgoing::request("search", &value).unwrap()]);
        assert_eq!(
            replies,
            vec![Reply::Result(json!(format!("No match for '{value}'.")))]
        );
    }

    #[test]
    fn test_peer_closes_mid_header() {
        let mut server = server();
        let addr = server.local_addr().unwrap();

        let mut peer = std::net::TcpStream::connect(addr).unwrap();
        peer.write_all(&[0, 60]).unwrap();
        drop(peer);

        for _ in 0..MAX_TURNS {
            server.turn(TICK).unwrap();
            if server.stats().failed == 1 {
                break;
            }
        }

        let stats = server.stats();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 0);
        assert_eq!(server.connection_count(), 0);

        // The loop keeps serving other peers
        let mut client = client(addr, &[Outgoing::request("search", "ring").unwrap()]);
        for _ in 0..MAX_TURNS {
            if client.connection_count() == 0 {
                break;
            }
            server.turn(TICK).unwrap();
            client.turn(TICK).unwrap();
        }
        assert_eq!(
            client.take_outcomes(),
            vec![Reply::Result(json!(
                "In the caves beneath the Misty Mountains. 💍"
            ))]
        );
    }

    #[test]
    fn test_malformed_header_closes_only_offender() {
        let mut server = server();
        let addr = server.local_addr().unwrap();

        let mut bad = std::net::TcpStream::connect(addr).unwrap();
        let header = br#"{"content-type":"text/json"}"#;
        bad.write_all(&(header.len() as u16).to_be_bytes()).unwrap();
        bad.write_all(header).unwrap();

        let mut client = client(addr, &[Outgoing::request("search", "morpheus").unwrap()]);
        for _ in 0..MAX_TURNS {
            if client.connection_count() == 0 && server.stats().failed == 1 {
                break;
            }
            server.turn(TICK).unwrap();
            client.turn(TICK).unwrap();
        }

        assert_eq!(server.stats().failed, 1);
        assert_eq!(client.take_outcomes().len(), 1);
    }

    #[test]
    fn test_connection_refused_is_per_connection() {
        // Bind then drop to find a port with no listener
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let mut client = client(addr, &[Outgoing::request("search", "x").unwrap()]);
        for _ in 0..MAX_TURNS {
            if client.connection_count() == 0 {
                break;
            }
            client.turn(TICK).unwrap();
        }

        assert_eq!(client.connection_count(), 0);
        assert_eq!(client.stats().failed, 1);
        assert!(client.take_outcomes().is_empty());
    }

    #[test]
    fn test_connection_limit() {
        let mut dispatcher: Dispatcher<Requester<TcpStream>> = Dispatcher::new(1, 8).unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let request = Outgoing::request("search", "x").unwrap();

        let first = Requester::new(
            Endpoint::new(TcpStream::connect(addr).unwrap(), "first"),
            request.clone(),
        );
        let second = Requester::new(
            Endpoint::new(TcpStream::connect(addr).unwrap(), "second"),
            request,
        );

        assert!(dispatcher.register(first).is_ok());
        assert!(dispatcher.register(second).is_err());
        assert_eq!(dispatcher.connection_count(), 1);
    }

    #[test]
    fn test_rejected_peers_not_counted_as_accepted() {
        let mut server = server_with_limit(1);
        let addr = server.local_addr().unwrap();
        let _first = std::net::TcpStream::connect(addr).unwrap();
        let _second = std::net::TcpStream::connect(addr).unwrap();

        for _ in 0..MAX_TURNS {
            server.turn(TICK).unwrap();
            let stats = server.stats();
            if stats.accepted + stats.rejected == 2 {
                break;
            }
        }

        let stats = server.stats();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(server.connection_count(), 1);
    }

    #[test]
    fn test_register_released_role_leaves_no_entry() {
        let mut dispatcher: Dispatcher<Requester<TcpStream>> = Dispatcher::new(4, 8).unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let request = Outgoing::request("search", "x").unwrap();

        let mut released = Requester::new(
            Endpoint::new(TcpStream::connect(addr).unwrap(), "released"),
            request.clone(),
        );
        released.release();

        let err = dispatcher.register(released).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert_eq!(dispatcher.connection_count(), 0);

        // The slot is still free for the next connection
        let fresh = Requester::new(
            Endpoint::new(TcpStream::connect(addr).unwrap(), "fresh"),
            request,
        );
        assert_eq!(dispatcher.register(fresh).unwrap(), 0);
        assert_eq!(dispatcher.connection_count(), 1);
    }

    #[test]
    fn test_shutdown_closes_everything() {
        let mut server = server();
        let addr = server.local_addr().unwrap();
        let _peer = std::net::TcpStream::connect(addr).unwrap();

        for _ in 0..MAX_TURNS {
            server.turn(TICK).unwrap();
            if server.connection_count() == 1 {
                break;
            }
        }
        assert_eq!(server.connection_count(), 1);

        server.shutdown();
        server.shutdown();
        assert_eq!(server.connection_count(), 0);
        assert!(server.local_addr().is_none());
    }

    #[test]
    fn test_run_until_idle_honours_stop() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = client(addr, &[Outgoing::request("search", "x").unwrap()]);

        let stop = AtomicBool::new(true);
        client.run_until_idle(TICK, &stop).unwrap();
        assert_eq!(client.connection_count(), 1);

        client.shutdown();
        assert_eq!(client.connection_count(), 0);
    }
}
