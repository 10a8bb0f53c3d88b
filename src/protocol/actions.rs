//! Answers the responder gives to decoded requests.
//!
//! Structured requests name an `action`; the only one understood is
//! `search`, which looks its `value` up in a fixed answer table. Binary
//! requests skip the table and get a fixed transformation of their bytes.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::{json, Value};

use super::codec::CodecError;
use super::message::{Content, Message, Outgoing, SEARCH_ACTION, SERVER_BINARY_TYPE};

/// Prefix of every binary response.
pub const BINARY_RESPONSE_LABEL: &[u8] = b"First 10 bytes of request: ";

/// Number of request bytes echoed in a binary response.
pub const BINARY_ECHO_LEN: usize = 10;

/// Immutable query → answer mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionTable {
    answers: HashMap<String, String>,
}

impl Default for ActionTable {
    fn default() -> Self {
        let answers = [
            ("morpheus", "Follow the white rabbit. \u{1f430}"),
            ("ring", "In the caves beneath the Misty Mountains. \u{1f48d}"),
            ("\u{1f436}", "\u{1f43e} Playing ball! \u{1f3d0}"),
        ]
        .into_iter()
        .map(|(query, answer)| (query.to_string(), answer.to_string()))
        .collect();

        Self { answers }
    }
}

impl ActionTable {
    /// Table with exactly the given answers.
    pub fn new(answers: HashMap<String, String>) -> Self {
        Self { answers }
    }

    /// Built-in answers, extended or overridden by `extra`.
    pub fn with_overrides(extra: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut table = Self::default();
        table.answers.extend(extra);
        table
    }

    pub fn lookup(&self, query: &str) -> Option<&str> {
        self.answers.get(query).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.answers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.answers.is_empty()
    }

    /// Build the response for a decoded request.
    pub fn respond(&self, request: &Message) -> Result<Outgoing, CodecError> {
        match &request.content {
            Content::Json(value) => Outgoing::json(&self.answer(value)),
            Content::Binary(bytes) => Ok(Outgoing::binary(
                Self::answer_binary(bytes),
                SERVER_BINARY_TYPE,
            )),
        }
    }

    /// Structured result for a structured request.
    ///
    /// Bad input is answered, never rejected.
    pub fn answer(&self, request: &Value) -> Value {
        let action = request.get("action");
        let result = match action.and_then(Value::as_str) {
            Some(SEARCH_ACTION) => {
                let query = request.get("value");
                match query.and_then(Value::as_str).and_then(|q| self.lookup(q)) {
                    Some(answer) => answer.to_string(),
                    None => format!("No match for '{}'.", display_field(query)),
                }
            }
            _ => format!("Error: invalid action '{}'.", display_field(action)),
        };
        json!({ "result": result })
    }

    /// Label followed by the first bytes of the request.
    pub fn answer_binary(request: &[u8]) -> Bytes {
        let echoed = &request[..request.len().min(BINARY_ECHO_LEN)];
        let mut out = BytesMut::with_capacity(BINARY_RESPONSE_LABEL.len() + echoed.len());
        out.put_slice(BINARY_RESPONSE_LABEL);
        out.put_slice(echoed);
        out.freeze()
    }
}

/// Render a request field for an answer: strings bare, anything else as JSON.
fn display_field(field: Option<&Value>) -> String {
    match field {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "null".to_string(),
    }
}
