//! JSON header carried in front of every payload.
//!
//! The header names the payload's type, encoding and length, plus the
//! sender's byte order. All four keys must be present or the message is
//! rejected; unknown keys are ignored.

use encoding_rs::Encoding;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::codec::CodecError;

/// Header keys every message must carry, in validation order.
pub const REQUIRED_HEADERS: [&str; 4] = [
    "byteorder",
    "content-length",
    "content-type",
    "content-encoding",
];

/// Content type of structured (JSON) payloads.
pub const JSON_CONTENT_TYPE: &str = "text/json";

/// Byte order tag of the running host, as carried in `byteorder`.
pub fn native_byte_order() -> &'static str {
    if cfg!(target_endian = "little") {
        "little"
    } else {
        "big"
    }
}

/// Decoded message header.
///
/// Fields serialize in wire order: `byteorder`, `content-type`,
/// `content-encoding`, `content-length`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub byteorder: String,
    #[serde(rename = "content-type")]
    pub content_type: String,
    #[serde(rename = "content-encoding")]
    pub content_encoding: String,
    #[serde(rename = "content-length")]
    pub content_length: usize,
}

impl MessageHeader {
    /// Build a header for a locally produced payload.
    pub fn new(content_type: &str, content_encoding: &str, content_length: usize) -> Self {
        Self {
            byteorder: native_byte_order().to_string(),
            content_type: content_type.to_string(),
            content_encoding: content_encoding.to_string(),
            content_length,
        }
    }

    /// Whether the payload is a JSON document.
    pub fn is_json(&self) -> bool {
        self.content_type == JSON_CONTENT_TYPE
    }

    /// Text encoding named by `content-encoding`, if the label is known.
    ///
    /// Labels are matched case-insensitively; `latin-1` style spellings
    /// are retried without their separators.
    pub fn text_encoding(&self) -> Option<&'static Encoding> {
        let label = self.content_encoding.trim();
        Encoding::for_label(label.as_bytes()).or_else(|| {
            let compact: String = label.chars().filter(|c| !matches!(c, '-' | '_')).collect();
            Encoding::for_label(compact.as_bytes())
        })
    }

    /// Serialize as UTF-8 JSON text.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(CodecError::InvalidHeader)
    }

    /// Parse and validate a header from raw bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CodecError> {
        let value: Value = serde_json::from_slice(bytes).map_err(CodecError::InvalidHeader)?;
        let Value::Object(map) = value else {
            return Err(CodecError::HeaderNotObject);
        };

        if let Some(missing) = REQUIRED_HEADERS.iter().find(|key| !map.contains_key(**key)) {
            return Err(CodecError::MissingHeader(*missing));
        }

        serde_json::from_value(Value::Object(map)).map_err(CodecError::InvalidHeader)
    }
}
