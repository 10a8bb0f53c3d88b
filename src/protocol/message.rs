//! Decoded and outgoing messages.

use std::fmt;

use bytes::Bytes;
use serde_json::{json, Value};

use super::codec::{self, CodecError};
use super::header::{MessageHeader, JSON_CONTENT_TYPE};

/// Content type of binary requests built by the client.
pub const CLIENT_BINARY_TYPE: &str = "binary/custom-client-binary-type";

/// Content type of binary responses built by the server.
pub const SERVER_BINARY_TYPE: &str = "binary/custom-server-binary-type";

pub const UTF8_ENCODING: &str = "utf-8";
pub const BINARY_ENCODING: &str = "binary";

/// Action name that selects a structured request.
pub const SEARCH_ACTION: &str = "search";

/// Decoded payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    /// `text/json` payload parsed into a document.
    Json(Value),
    /// Any other content type, passed through untouched.
    Binary(Bytes),
}

impl Content {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Content::Json(value) => Some(value),
            Content::Binary(_) => None,
        }
    }

    pub fn as_binary(&self) -> Option<&Bytes> {
        match self {
            Content::Binary(bytes) => Some(bytes),
            Content::Json(_) => None,
        }
    }
}

/// A fully received message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: MessageHeader,
    pub content: Content,
}

impl Message {
    /// Decode a complete payload according to its header.
    pub(crate) fn decode(header: MessageHeader, payload: Bytes) -> Result<Self, CodecError> {
        let content = if header.is_json() {
            let encoding = header
                .text_encoding()
                .ok_or_else(|| CodecError::UnsupportedEncoding(header.content_encoding.clone()))?;
            let decoded = encoding
                .decode_without_bom_handling_and_without_replacement(&payload)
                .ok_or(CodecError::MalformedText(encoding.name()))?;
            // A UTF-16 sender may lead with a byte order mark
            let text = decoded.strip_prefix('\u{feff}').unwrap_or(&decoded);
            Content::Json(serde_json::from_str(text).map_err(CodecError::InvalidContent)?)
        } else {
            Content::Binary(payload)
        };

        Ok(Self { header, content })
    }

    pub fn content_type(&self) -> &str {
        &self.header.content_type
    }
}

/// A payload ready to be framed and sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub payload: Bytes,
    pub content_type: String,
    pub content_encoding: String,
}

impl Outgoing {
    /// Structured payload, serialized as UTF-8 JSON.
    pub fn json(value: &Value) -> Result<Self, CodecError> {
        let payload = serde_json::to_vec(value).map_err(CodecError::InvalidContent)?;
        Ok(Self {
            payload: Bytes::from(payload),
            content_type: JSON_CONTENT_TYPE.to_string(),
            content_encoding: UTF8_ENCODING.to_string(),
        })
    }

    /// Opaque payload of the given content type.
    pub fn binary(payload: impl Into<Bytes>, content_type: &str) -> Self {
        Self {
            payload: payload.into(),
            content_type: content_type.to_string(),
            content_encoding: BINARY_ENCODING.to_string(),
        }
    }

    /// Client request for an action/value pair.
    ///
    /// `search` becomes a structured request; any other action is sent as
    /// the raw bytes of `action` followed by `value`.
    pub fn request(action: &str, value: &str) -> Result<Self, CodecError> {
        if action == SEARCH_ACTION {
            Self::json(&json!({ "action": action, "value": value }))
        } else {
            Ok(Self::binary(
                format!("{action}{value}").into_bytes(),
                CLIENT_BINARY_TYPE,
            ))
        }
    }

    /// Frame for the wire.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        codec::encode(&self.payload, &self.content_type, &self.content_encoding)
    }
}

/// What a requester surfaces once its response arrives.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// The `result` field of a structured response (`Null` when absent).
    Result(Value),
    /// A binary response.
    Binary { content_type: String, payload: Bytes },
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Result(Value::String(s)) => write!(f, "{s}"),
            Reply::Result(other) => write!(f, "{other}"),
            Reply::Binary { payload, .. } => write!(f, "{}", payload.escape_ascii()),
        }
    }
}
