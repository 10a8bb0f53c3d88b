//! framewire: one-shot request/response messaging over TCP.
//!
//! Every message is framed as a big-endian `u16` header length, a UTF-8
//! JSON header describing the payload, and the payload itself. A server
//! answers exactly one request per connection; a client sends one request
//! per connection and reports the reply.

pub mod config;
pub mod protocol;
pub mod runtime;
