//! Bidirectional connections between anonymous workers behind a load balancer, built from
//!  long-lived HTTP responses.
//!
//! Each process runs a [Dispatcher](dispatcher::dispatcher::Dispatcher). Dispatchers probe a shared
//!  rendezvous address, and every probe response that stays open becomes a channel between two
//!  dispatchers. A connection pairs one channel in each direction, and it is established through
//!  a [ConnectionFactory](connection::connection_factory::ConnectionFactory).

pub mod channel;
pub mod connection;
pub mod dispatcher;
pub mod http;
pub mod test_util;
pub mod util;
pub mod wire;
