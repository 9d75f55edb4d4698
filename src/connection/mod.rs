pub mod connection;
pub mod connection_factory;
