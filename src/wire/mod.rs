//! Byte-level formats on a channel stream: the dispatcher id handshake at the start, followed
//!  by fixed-size control packets until the channel is claimed by a connection.

pub mod handshake;
pub mod wire_format;
