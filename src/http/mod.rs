//! HTTP glue: the streamed bodies that carry channels, the outbound probe, and a server that
//!  routes requests to dispatchers

pub mod body;
pub mod probe_client;
pub mod server;
