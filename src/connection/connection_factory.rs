use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::connection::connection::Connection;
use crate::dispatcher::dispatcher::{Dispatcher, DispatcherContext};
use crate::dispatcher::events::{ClientConnectEvent, DispatcherEvent, ServerAcceptEvent};

/// Failures that are reported to callers of [ConnectionFactory]. They are wrapped in
///  `anyhow::Error` and can be inspected with `downcast_ref`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ConnectionError {
    Timeout { destination: String, elapsed: Duration },
    /// the connection was closed while it was being established
    Closed,
    /// the channel for the connection failed while it was being established
    ChannelFailed,
    DispatcherStopped,
}

impl Display for ConnectionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Timeout { destination, elapsed } => write!(f, "could not reach {} after {:?}", destination, elapsed),
            ConnectionError::Closed => write!(f, "connection closed unexpectedly"),
            ConnectionError::ChannelFailed => write!(f, "channel failed while connecting"),
            ConnectionError::DispatcherStopped => write!(f, "dispatcher stopped"),
        }
    }
}

impl std::error::Error for ConnectionError {}

/// The API for establishing connections through a [Dispatcher]
#[derive(Clone)]
pub struct ConnectionFactory {
    ctx: Arc<DispatcherContext>,
}

impl ConnectionFactory {
    pub fn new(dispatcher: &Dispatcher) -> ConnectionFactory {
        ConnectionFactory {
            ctx: dispatcher.context(),
        }
    }

    /// Connect to a remote dispatcher whose id starts with `to_machine`. If several known
    ///  dispatchers match, the most recently started one is used.
    ///
    /// If no matching dispatcher is known yet, this waits for one to show up, failing with
    ///  [ConnectionError::Timeout] eventually. With `cancel_if_unavailable`, it returns `None`
    ///  right away instead.
    pub async fn connect(&self, to_machine: &str, cancel_if_unavailable: bool) -> anyhow::Result<Option<Connection>> {
        let connection_id = Uuid::new_v4();
        debug!(dispatcher = %self.ctx.short_id(), %connection_id, destination = to_machine, "connect called");

        let (response, receiver) = oneshot::channel();
        self.ctx.submit(DispatcherEvent::ClientConnect(ClientConnectEvent {
            connection_id,
            to_machine: to_machine.to_string(),
            issued: Instant::now(),
            response,
            dont_queue: cancel_if_unavailable,
        }));

        receiver.await
            .map_err(|_| ConnectionError::DispatcherStopped)?
    }

    /// Wait for the next incoming connection
    pub async fn accept(&self) -> anyhow::Result<Connection> {
        debug!(dispatcher = %self.ctx.short_id(), "accept called");

        let (response, receiver) = oneshot::channel();
        self.ctx.submit(DispatcherEvent::ServerAccept(ServerAcceptEvent { response }));

        receiver.await
            .map_err(|_| ConnectionError::DispatcherStopped)?
    }
}
