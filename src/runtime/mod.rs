//! Single-threaded readiness runtime.
//!
//! Layers, bottom up:
//! - `Endpoint`: one socket plus its outbound and inbound buffers
//! - `Requester` / `Responder`: roles driving the codec through one exchange
//! - `Dispatcher`: the mio reactor owning the registration table

mod connection;
mod endpoint;
mod event_loop;
mod requester;
mod responder;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{ConnectionError, ConnectionRegistry, Registration, Role, Transition};
pub use endpoint::{Endpoint, EndpointError, Transport, RECV_WINDOW};
pub use event_loop::{create_listener, DispatchStats, Dispatcher, EVENTS_CAPACITY};
pub use requester::{Requester, RequesterState};
pub use responder::{Responder, ResponderState};

use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::AtomicBool;

use mio::event::Source;
use mio::net::TcpStream;
use tracing::{info, warn};

use crate::config::Config;
use crate::protocol::{ActionTable, Outgoing, Reply};

/// Serve requests on `addr` until `stop` is set.
pub fn run_server(
    config: &Config,
    addr: SocketAddr,
    stop: &AtomicBool,
) -> io::Result<DispatchStats> {
    let actions = Rc::new(ActionTable::with_overrides(config.answers.clone()));
    let answers = actions.len();
    let max_buffer = config.max_buffer;

    let mut dispatcher = Dispatcher::new(config.max_connections, EVENTS_CAPACITY)?;
    dispatcher.listen(create_listener(addr)?, move |stream, peer| {
        let endpoint = Endpoint::new(stream, peer.to_string()).with_max_inbound(max_buffer);
        Responder::new(endpoint, Rc::clone(&actions))
    })?;

    info!(
        addr = %addr,
        answers,
        max_connections = config.max_connections,
        "Listening"
    );

    let result = dispatcher.run_forever(config.poll_timeout, stop);
    dispatcher.shutdown();
    result?;

    Ok(dispatcher.stats())
}

/// Send `request` over `config.connections` connections and collect replies.
pub fn run_client(
    config: &Config,
    addr: SocketAddr,
    request: &Outgoing,
    stop: &AtomicBool,
) -> io::Result<Vec<Reply>> {
    let mut dispatcher = Dispatcher::new(config.connections, EVENTS_CAPACITY)?;
    let label = format!("{}:{}", config.host, config.port);
    let max_buffer = config.max_buffer;

    start_requesters(&mut dispatcher, config.connections, request, |index| {
        info!(connection = index, peer = %label, "Starting connection");
        let stream = TcpStream::connect(addr)?;
        Ok(Endpoint::new(stream, label.clone()).with_max_inbound(max_buffer))
    });

    let result = dispatcher.run_until_idle(config.poll_timeout, stop);
    dispatcher.shutdown();
    result?;

    let stats = dispatcher.stats();
    if stats.failed > 0 {
        warn!(failed = stats.failed, "Some connections failed");
    }
    info!(
        completed = stats.completed,
        failed = stats.failed,
        "All connections closed"
    );

    Ok(dispatcher.take_outcomes())
}

/// Register `count` requesters, numbered from 1.
///
/// A connection that cannot be opened or registered is logged and counted
/// as failed; the others still start.
fn start_requesters<S>(
    dispatcher: &mut Dispatcher<Requester<S>>,
    count: usize,
    request: &Outgoing,
    mut connect: impl FnMut(usize) -> io::Result<Endpoint<S>>,
) where
    S: Transport + Source,
{
    for index in 1..=count {
        let started = connect(index)
            .and_then(|endpoint| dispatcher.register(Requester::new(endpoint, request.clone())));
        if let Err(e) = started {
            warn!(connection = index, error = %e, "Connection failed to start");
            dispatcher.record_failure();
        }
    }
}
