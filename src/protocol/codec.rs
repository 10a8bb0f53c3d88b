//! Incremental framing for length-prefixed messages.
//!
//! Wire layout (big-endian):
//!
//! ```text
//! [2 bytes: header length N][N bytes: JSON header][content-length bytes: payload]
//! ```
//!
//! Parsing advances through the header length, the header and the payload
//! in order. Each stage consumes its bytes from the front of the inbound
//! buffer only once all of them are present, so a partial read leaves the
//! cursor where it was until more data arrives.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::header::MessageHeader;
use super::message::Message;

/// Size of the big-endian header length prefix.
pub const HEADER_LENGTH_PREFIX: usize = 2;

/// Framing and decoding errors. All are fatal for the connection.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("missing required header '{0}'")]
    MissingHeader(&'static str),

    #[error("invalid header: {0}")]
    InvalidHeader(#[source] serde_json::Error),

    #[error("header is not a JSON object")]
    HeaderNotObject,

    #[error("header of {0} bytes does not fit the length prefix")]
    HeaderTooLarge(usize),

    #[error("unsupported content encoding '{0}'")]
    UnsupportedEncoding(String),

    #[error("payload is not valid {0} text")]
    MalformedText(&'static str),

    #[error("invalid JSON content: {0}")]
    InvalidContent(#[source] serde_json::Error),
}

/// Frame a payload: `[u16 header length][header][payload]`.
pub fn encode(
    payload: &[u8],
    content_type: &str,
    content_encoding: &str,
) -> Result<Bytes, CodecError> {
    let header = MessageHeader::new(content_type, content_encoding, payload.len());
    let header_bytes = header.to_bytes()?;
    let header_len = u16::try_from(header_bytes.len())
        .map_err(|_| CodecError::HeaderTooLarge(header_bytes.len()))?;

    let mut buf =
        BytesMut::with_capacity(HEADER_LENGTH_PREFIX + header_bytes.len() + payload.len());
    buf.put_u16(header_len);
    buf.put_slice(&header_bytes);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Parsing progress, observable for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParseStage {
    HeaderLength,
    Header,
    Payload,
    Decoded,
}

#[derive(Debug)]
enum ParseCursor {
    AwaitingHeaderLength,
    AwaitingHeader { header_len: usize },
    AwaitingPayload { header: MessageHeader },
    Decoded(Message),
}

/// Stateful decoder for one message at a time.
#[derive(Debug)]
pub struct Codec {
    cursor: ParseCursor,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec {
    pub fn new() -> Self {
        Self {
            cursor: ParseCursor::AwaitingHeaderLength,
        }
    }

    /// Current parse stage.
    pub fn stage(&self) -> ParseStage {
        match self.cursor {
            ParseCursor::AwaitingHeaderLength => ParseStage::HeaderLength,
            ParseCursor::AwaitingHeader { .. } => ParseStage::Header,
            ParseCursor::AwaitingPayload { .. } => ParseStage::Payload,
            ParseCursor::Decoded(_) => ParseStage::Decoded,
        }
    }

    /// Advance as far as the buffered bytes allow.
    ///
    /// Returns the decoded message once all stages are complete. Bytes
    /// beyond the current message stay in `inbound`.
    pub fn advance(&mut self, inbound: &mut BytesMut) -> Result<Option<&Message>, CodecError> {
        while self.step(inbound)? {}

        match &self.cursor {
            ParseCursor::Decoded(message) => Ok(Some(message)),
            _ => Ok(None),
        }
    }

    /// Take the decoded message and start over for the next one.
    pub fn take_message(&mut self) -> Option<Message> {
        if !matches!(self.cursor, ParseCursor::Decoded(_)) {
            return None;
        }
        match std::mem::replace(&mut self.cursor, ParseCursor::AwaitingHeaderLength) {
            ParseCursor::Decoded(message) => Some(message),
            _ => None,
        }
    }

    /// Run one stage. Returns `false` when waiting for more bytes.
    fn step(&mut self, inbound: &mut BytesMut) -> Result<bool, CodecError> {
        let next = match &self.cursor {
            ParseCursor::AwaitingHeaderLength => {
                if inbound.len() < HEADER_LENGTH_PREFIX {
                    return Ok(false);
                }
                ParseCursor::AwaitingHeader {
                    header_len: usize::from(inbound.get_u16()),
                }
            }
            ParseCursor::AwaitingHeader { header_len } => {
                if inbound.len() < *header_len {
                    return Ok(false);
                }
                let raw = inbound.split_to(*header_len);
                ParseCursor::AwaitingPayload {
                    header: MessageHeader::from_slice(&raw)?,
                }
            }
            ParseCursor::AwaitingPayload { header } => {
                if inbound.len() < header.content_length {
                    return Ok(false);
                }
                let payload = inbound.split_to(header.content_length).freeze();
                ParseCursor::Decoded(Message::decode(header.clone(), payload)?)
            }
            ParseCursor::Decoded(_) => return Ok(false),
        };

        self.cursor = next;
        Ok(true)
    }
}
