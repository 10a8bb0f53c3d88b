//! Message framing and the responder's answer table.
//!
//! Every message is a big-endian `u16` header length, a UTF-8 JSON header
//! (`byteorder`, `content-type`, `content-encoding`, `content-length`) and
//! the payload. `text/json` payloads are decoded into documents; every
//! other content type is carried as opaque bytes.

pub mod actions;
pub mod codec;
pub mod header;
pub mod message;

pub use actions::ActionTable;
pub use codec::{Codec, CodecError, ParseStage};
pub use header::MessageHeader;
pub use message::{Content, Message, Outgoing, Reply};
