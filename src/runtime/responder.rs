//! Server side of an exchange: read one request, send one response.

use std::rc::Rc;

use mio::Interest;
use tracing::{debug, info};

use crate::protocol::{ActionTable, Codec, Content, Message};
use crate::runtime::connection::{ConnectionError, Role, Transition};
use crate::runtime::endpoint::{Endpoint, Transport};

/// Progress of a responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderState {
    /// Reading the request.
    AwaitingRequest,
    /// Request decoded; response being built and written.
    ReadyToRespond,
    /// Response fully flushed.
    ResponseSent,
    /// Connection released.
    Completed,
}

pub struct Responder<S> {
    endpoint: Endpoint<S>,
    codec: Codec,
    actions: Rc<ActionTable>,
    state: ResponderState,
    request: Option<Message>,
    response_built: bool,
}

impl<S: Transport> Responder<S> {
    pub fn new(endpoint: Endpoint<S>, actions: Rc<ActionTable>) -> Self {
        Self {
            endpoint,
            codec: Codec::new(),
            actions,
            state: ResponderState::AwaitingRequest,
            request: None,
            response_built: false,
        }
    }

    pub fn state(&self) -> ResponderState {
        self.state
    }

    /// Build and enqueue the response. Runs at most once per connection.
    fn build_response(&mut self) -> Result<(), ConnectionError> {
        let Some(request) = self.request.as_ref() else {
            return Ok(());
        };
        if self.response_built {
            return Ok(());
        }

        if let Content::Json(value) = &request.content {
            if !value.is_object() {
                return Err(ConnectionError::Protocol(format!(
                    "structured request is not an object: {value}"
                )));
            }
        }

        let response = self.actions.respond(request)?;
        let wire = response.encode()?;
        self.endpoint.enqueue(&wire);
        self.response_built = true;

        debug!(
            peer = %self.endpoint.peer(),
            content_type = %response.content_type,
            bytes = wire.len(),
            "Queued response"
        );
        Ok(())
    }
}

impl<S: Transport> Role for Responder<S> {
    type Stream = S;
    type Outcome = ();

    fn initial_interest(&self) -> Interest {
        Interest::READABLE
    }

    fn on_readable(&mut self) -> Result<Transition, ConnectionError> {
        if self.state != ResponderState::AwaitingRequest {
            return Ok(Transition::Continue);
        }

        loop {
            let received = self.endpoint.pull()?;
            if self.codec.advance(self.endpoint.inbound_mut())?.is_some() {
                break;
            }
            if received == 0 {
                return Ok(Transition::Continue);
            }
        }

        let Some(message) = self.codec.take_message() else {
            return Ok(Transition::Continue);
        };
        match &message.content {
            Content::Json(value) => {
                info!(peer = %self.endpoint.peer(), request = %value, "Received request")
            }
            Content::Binary(bytes) => info!(
                peer = %self.endpoint.peer(),
                content_type = %message.content_type(),
                bytes = bytes.len(),
                "Received request"
            ),
        }

        self.request = Some(message);
        self.state = ResponderState::ReadyToRespond;
        Ok(Transition::Reregister(Interest::WRITABLE))
    }

    fn on_writable(&mut self) -> Result<Transition, ConnectionError> {
        self.build_response()?;

        loop {
            let sent = self.endpoint.flush()?;
            if self.endpoint.is_write_complete() || sent == 0 {
                break;
            }
        }

        if self.response_built && self.endpoint.is_write_complete() {
            self.state = ResponderState::ResponseSent;
            return Ok(Transition::Close);
        }
        Ok(Transition::Continue)
    }

    fn source(&mut self) -> Option<&mut S> {
        self.endpoint.stream_mut()
    }

    fn release(&mut self) {
        self.endpoint.release();
        self.state = ResponderState::Completed;
    }

    fn take_outcome(&mut self) -> Option<()> {
        None
    }
}
