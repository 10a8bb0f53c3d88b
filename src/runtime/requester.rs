//! Client side of an exchange: send one request, read one response.

use mio::Interest;
use tracing::{debug, info};

use crate::protocol::{Codec, Content, Message, Outgoing, Reply};
use crate::runtime::connection::{ConnectionError, Role, Transition};
use crate::runtime::endpoint::{Endpoint, Transport};

/// Progress of a requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequesterState {
    /// Request not yet encoded.
    NotQueued,
    /// Request encoded and being written.
    Queued,
    /// Request flushed; reading the response.
    AwaitingResponse,
    /// Response handled or connection released.
    Completed,
}

pub struct Requester<S> {
    endpoint: Endpoint<S>,
    codec: Codec,
    request: Outgoing,
    state: RequesterState,
    reply: Option<Reply>,
}

impl<S: Transport> Requester<S> {
    /// The request is encoded lazily, on the first write readiness.
    pub fn new(endpoint: Endpoint<S>, request: Outgoing) -> Self {
        Self {
            endpoint,
            codec: Codec::new(),
            request,
            state: RequesterState::NotQueued,
            reply: None,
        }
    }

    pub fn state(&self) -> RequesterState {
        self.state
    }

    fn queue_request(&mut self) -> Result<(), ConnectionError> {
        let wire = self.request.encode()?;
        self.endpoint.enqueue(&wire);
        self.state = RequesterState::Queued;
        debug!(
            peer = %self.endpoint.peer(),
            content_type = %self.request.content_type,
            bytes = wire.len(),
            "Queued request"
        );
        Ok(())
    }

    fn handle_response(&mut self, message: Message) -> Result<Reply, ConnectionError> {
        let reply = match message.content {
            Content::Json(value) => {
                if !value.is_object() {
                    return Err(ConnectionError::Protocol(format!(
                        "structured response is not an object: {value}"
                    )));
                }
                Reply::Result(value.get("result").cloned().unwrap_or_default())
            }
            Content::Binary(payload) => Reply::Binary {
                content_type: message.header.content_type,
                payload,
            },
        };
        info!(peer = %self.endpoint.peer(), reply = %reply, "Got response");
        Ok(reply)
    }
}

impl<S: Transport> Role for Requester<S> {
    type Stream = S;
    type Outcome = Reply;

    fn initial_interest(&self) -> Interest {
        Interest::WRITABLE
    }

    fn on_writable(&mut self) -> Result<Transition, ConnectionError> {
        match self.state {
            RequesterState::NotQueued => self.queue_request()?,
            RequesterState::Queued => {}
            RequesterState::AwaitingResponse | RequesterState::Completed => {
                return Ok(Transition::Continue);
            }
        }

        // Readiness is edge-triggered: keep writing until done or blocked.
        loop {
            let sent = self.endpoint.flush()?;
            if self.endpoint.is_write_complete() || sent == 0 {
                break;
            }
        }

        if self.endpoint.is_write_complete() {
            self.state = RequesterState::AwaitingResponse;
            return Ok(Transition::Reregister(Interest::READABLE));
        }
        Ok(Transition::Continue)
    }

    fn on_readable(&mut self) -> Result<Transition, ConnectionError> {
        if self.state != RequesterState::AwaitingResponse {
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
        let reply = self.handle_response(message)?;
        self.reply = Some(reply);
        self.state = RequesterState::Completed;
        Ok(Transition::Close)
    }

    fn source(&mut self) -> Option<&mut S> {
        self.endpoint.stream_mut()
    }

    fn release(&mut self) {
        self.endpoint.release();
        self.state = RequesterState::Completed;
    }

    fn take_outcome(&mut self) -> Option<Reply> {
        self.reply.take()
    }
}
