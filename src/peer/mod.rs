//! Peer wire protocol: handshake framing, message codec, and the
//! per-connection session state machine.
pub mod handshake;
pub mod message;
pub mod session;
