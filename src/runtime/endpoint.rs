//! Socket ownership and byte accumulation for one connection.
//!
//! An `Endpoint` holds the socket plus an outbound and an inbound buffer.
//! `flush` and `pull` each make a single non-blocking attempt; a
//! would-block outcome is reported as zero bytes moved, never as an error.

use std::io::{self, Read, Write};
use std::net::Shutdown;

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Size of the scratch window for a single receive.
pub const RECV_WINDOW: usize = 4096;

/// A non-blocking byte stream an endpoint can own.
pub trait Transport: Read + Write {
    /// Shut the stream down. Called at most once per endpoint.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Pending asynchronous error, such as a refused connect.
    fn take_error(&self) -> io::Result<Option<io::Error>> {
        Ok(None)
    }
}

impl Transport for mio::net::TcpStream {
    fn take_error(&self) -> io::Result<Option<io::Error>> {
        mio::net::TcpStream::take_error(self)
    }

    fn close(&mut self) -> io::Result<()> {
        match self.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

/// Endpoint failures. Each one ends the connection.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("peer closed the connection")]
    PeerClosed,

    #[error("inbound buffer exceeded {limit} bytes")]
    BufferOverflow { limit: usize },

    #[error("endpoint already released")]
    Released,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Owner of one socket and its byte buffers.
#[derive(Debug)]
pub struct Endpoint<S> {
    stream: Option<S>,
    peer: String,
    outbound: BytesMut,
    inbound: BytesMut,
    write_complete: bool,
    max_inbound: Option<usize>,
}

impl<S: Transport> Endpoint<S> {
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream: Some(stream),
            peer: peer.into(),
            outbound: BytesMut::new(),
            inbound: BytesMut::with_capacity(RECV_WINDOW),
            write_complete: true,
            max_inbound: None,
        }
    }

    /// Cap the inbound buffer. `None` leaves it unbounded.
    pub fn with_max_inbound(mut self, limit: Option<usize>) -> Self {
        self.max_inbound = limit;
        self
    }

    /// Peer label used in logs.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Append to the outbound buffer.
    pub fn enqueue(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.outbound.extend_from_slice(bytes);
        self.write_complete = false;
    }

    /// Try once to send the outbound buffer.
    ///
    /// Returns the number of bytes sent; zero when the socket would block.
    pub fn flush(&mut self) -> Result<usize, EndpointError> {
        if self.outbound.is_empty() {
            self.write_complete = true;
            return Ok(0);
        }

        let stream = self.stream.as_mut().ok_or(EndpointError::Released)?;
        if let Some(e) = stream.take_error()? {
            return Err(e.into());
        }
        let sent = match stream.write(&self.outbound) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0").into());
            }
            Ok(n) => n,
            Err(ref e) if is_transient(e) => 0,
            Err(e) => return Err(e.into()),
        };

        self.outbound.advance(sent);
        if self.outbound.is_empty() {
            self.write_complete = true;
        }

        trace!(
            peer = %self.peer,
            sent,
            remaining = self.outbound.len(),
            "Flushed outbound bytes"
        );
        Ok(sent)
    }

    /// Try once to receive into the inbound buffer.
    ///
    /// Returns the number of bytes received; zero when nothing is available
    /// yet. A closed peer is an error.
    pub fn pull(&mut self) -> Result<usize, EndpointError> {
        let stream = self.stream.as_mut().ok_or(EndpointError::Released)?;

        let mut window = [0u8; RECV_WINDOW];
        let received = match stream.read(&mut window) {
            Ok(0) => return Err(EndpointError::PeerClosed),
            Ok(n) => n,
            Err(ref e) if is_transient(e) => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        if let Some(limit) = self.max_inbound {
            if self.inbound.len() + received > limit {
                return Err(EndpointError::BufferOverflow { limit });
            }
        }

        self.inbound.extend_from_slice(&window[..received]);
        trace!(
            peer = %self.peer,
            received,
            buffered = self.inbound.len(),
            "Received inbound bytes"
        );
        Ok(received)
    }

    /// Inbound bytes, consumed from the front by the codec.
    pub fn inbound_mut(&mut self) -> &mut BytesMut {
        &mut self.inbound
    }

    /// True once every enqueued byte has been sent.
    pub fn is_write_complete(&self) -> bool {
        self.write_complete
    }

    /// Bytes enqueued but not yet sent.
    pub fn pending_outbound(&self) -> usize {
        self.outbound.len()
    }

    pub fn is_released(&self) -> bool {
        self.stream.is_none()
    }

    /// The socket, for readiness registration.
    pub fn stream_mut(&mut self) -> Option<&mut S> {
        self.stream.as_mut()
    }

    /// Close the socket. Later calls do nothing.
    pub fn release(&mut self) {
        let Some(mut stream) = self.stream.take() else {
            return;
        };
        debug!(peer = %self.peer, "Closing connection");
        if let Err(e) = stream.close() {
            warn!(peer = %self.peer, error = %e, "Error closing socket");
        }
    }
}

/// Conditions that mean "try again on the next readiness event".
///
/// `NotConnected` covers writes to a socket whose non-blocking connect is
/// still in progress.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::NotConnected
    )
}
