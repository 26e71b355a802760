//! The local IPC bridge
//!
//! Local host processes reach the bus through three UDP sockets on loopback:
//! the responder (request/reply), the consumer (administrative commands), and
//! the broadcaster (bus event push). See [`wire`] for the message format.

pub mod broadcaster;
pub mod consumer;
pub mod responder;
pub mod wire;

pub use broadcaster::Broadcaster;
pub use responder::Responder;
