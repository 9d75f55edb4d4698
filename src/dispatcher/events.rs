use std::fmt::{Debug, Formatter};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use crate::channel::channel::{InChannel, OutChannel};
use crate::connection::connection::Connection;
use crate::connection::connection_factory::ConnectionError;

pub(crate) type ConnectResponse = oneshot::Sender<anyhow::Result<Option<Connection>>>;
pub(crate) type AcceptResponse = oneshot::Sender<anyhow::Result<Connection>>;

/// Everything that changes the dispatcher's state is an event, processed one at a time by the
///  dispatcher's processor task.
pub(crate) enum DispatcherEvent {
    /// a remote dispatcher's probe arrived, and we keep its response open as an out-channel
    NewChannel(OutChannel),
    ClientConnect(ClientConnectEvent),
    ServerAccept(ServerAcceptEvent),
    ServerConnect(ServerConnectEvent),
    ClientAccept(ClientAcceptEvent),
    ChannelClosed(ChannelClosedEvent),
    ConnectionClosed(ConnectionClosedEvent),
    Timer(TimerEvent),
    Status(oneshot::Sender<String>),
}

impl Debug for DispatcherEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatcherEvent::NewChannel(c) => write!(f, "NewChannel({:?})", c),
            DispatcherEvent::ClientConnect(e) => write!(f, "ClientConnect({} to {:?})", e.connection_id.simple(), e.to_machine),
            DispatcherEvent::ServerAccept(_) => write!(f, "ServerAccept"),
            DispatcherEvent::ServerConnect(e) => write!(f, "ServerConnect({} from {:?})", e.connection_id.simple(), e.in_channel.dispatcher_id),
            DispatcherEvent::ClientAccept(e) => write!(f, "ClientAccept({})", e.connection_id.simple()),
            DispatcherEvent::ChannelClosed(e) => write!(f, "ChannelClosed({}, {:?})", e.channel_id.simple(), e.origin),
            DispatcherEvent::ConnectionClosed(e) => write!(f, "ConnectionClosed({}, remote={})", e.connection_id.simple(), e.from_remote),
            DispatcherEvent::Timer(e) => write!(f, "Timer({})", e.count),
            DispatcherEvent::Status(_) => write!(f, "Status"),
        }
    }
}

impl DispatcherEvent {
    /// Events that wait for something (a channel, a notification to be delivered) give up after
    ///  the request timeout. The periodic timer sweeps them.
    pub fn timed_out(&self, now: Instant, timeout: Duration) -> bool {
        let issued = match self {
            DispatcherEvent::ClientConnect(e) => e.issued,
            DispatcherEvent::ServerConnect(e) => e.issued,
            DispatcherEvent::ChannelClosed(e) => e.issued,
            DispatcherEvent::ConnectionClosed(e) => e.issued,
            _ => return false,
        };
        now.saturating_duration_since(issued) > timeout
    }

    /// true if this is a pending request for the given connection, i.e. it should be cancelled
    ///  when the connection is closed
    pub fn cancel_with_connection(&self, connection_id: Uuid) -> bool {
        match self {
            DispatcherEvent::ClientConnect(e) => e.connection_id == connection_id,
            DispatcherEvent::ServerConnect(e) => e.connection_id == connection_id,
            _ => false,
        }
    }

    /// the dispatcher id prefix a waiting connect is looking for
    pub fn waits_for_machine(&self) -> Option<&str> {
        match self {
            DispatcherEvent::ClientConnect(e) => Some(&e.to_machine),
            _ => None,
        }
    }

    /// the full id of the dispatcher a waiting event needs a channel to
    pub fn waits_for_dispatcher(&self) -> Option<&str> {
        match self {
            DispatcherEvent::ServerConnect(e) => Some(&e.in_channel.dispatcher_id),
            DispatcherEvent::ChannelClosed(e) => e.dispatcher_id.as_deref(),
            DispatcherEvent::ConnectionClosed(e) => e.to_send.as_deref(),
            _ => None,
        }
    }

    pub fn handle_timeout(self, dispatcher: &str, now: Instant) {
        match self {
            DispatcherEvent::ClientConnect(e) => {
                let elapsed = now.saturating_duration_since(e.issued);
                warn!(dispatcher, connection_id = %e.connection_id, destination = %e.to_machine, "connect timed out after {:?}", elapsed);
                let destination = e.to_machine.clone();
                e.fail(ConnectionError::Timeout { destination, elapsed });
            }
            DispatcherEvent::ServerConnect(e) => {
                let elapsed = now.saturating_duration_since(e.issued);
                warn!(dispatcher, connection_id = %e.connection_id, destination = %e.in_channel.dispatcher_id, "connect from remote timed out waiting for a channel after {:?}", elapsed);
                e.dispose();
            }
            DispatcherEvent::ChannelClosed(e) => {
                warn!(dispatcher, channel_id = %e.channel_id, "ChannelClosed message timed out after {:?}", now.saturating_duration_since(e.issued));
            }
            DispatcherEvent::ConnectionClosed(e) => {
                warn!(dispatcher, connection_id = %e.connection_id, "ConnectionClosed message timed out after {:?}", now.saturating_duration_since(e.issued));
            }
            _ => {}
        }
    }

    /// Drop a pending event: callers are resolved with the given error, and channels held by the
    ///  event are disposed
    pub fn cancel(self, error: ConnectionError) {
        match self {
            DispatcherEvent::NewChannel(c) => c.dispose(),
            DispatcherEvent::ClientConnect(e) => e.fail(error),
            DispatcherEvent::ServerAccept(e) => {
                let _ = e.response.send(Err(error.into()));
            }
            DispatcherEvent::ServerConnect(e) => e.dispose(),
            DispatcherEvent::ClientAccept(e) => e.in_channel.dispose(),
            DispatcherEvent::ChannelClosed(_) |
            DispatcherEvent::ConnectionClosed(_) |
            DispatcherEvent::Timer(_) |
            DispatcherEvent::Status(_) => {}
        }
    }
}

/// a pending call to connect
pub(crate) struct ClientConnectEvent {
    pub connection_id: Uuid,
    pub to_machine: String,
    pub issued: Instant,
    pub response: ConnectResponse,
    pub dont_queue: bool,
}

impl ClientConnectEvent {
    pub fn fail(self, error: ConnectionError) {
        let _ = self.response.send(Err(error.into()));
    }
}

/// A connect for which the Connect packet was sent, waiting for the remote's Accept. It owns the
///  out-channel that is going to be part of the connection.
pub(crate) struct ConnectRequest {
    pub connection_id: Uuid,
    pub to_machine: String,
    pub issued: Instant,
    pub response: ConnectResponse,
    pub out_channel: OutChannel,
}

impl ConnectRequest {
    pub fn fail(self, error: ConnectionError) {
        self.out_channel.dispose();
        let _ = self.response.send(Err(error.into()));
    }
}

/// a pending call to accept
pub(crate) struct ServerAcceptEvent {
    pub response: AcceptResponse,
}

/// A remote's Connect packet arrived on one of our in-channels
pub(crate) struct ServerConnectEvent {
    pub connection_id: Uuid,
    pub in_channel: InChannel,
    /// the remote asked us to broadcast because it used its last pooled channel to us
    pub do_server_broadcast: bool,
    pub issued: Instant,
}

impl ServerConnectEvent {
    pub fn dispose(self) {
        self.in_channel.dispose();
    }
}

/// A remote's connect that has both its channels and waits for a local call to accept
pub(crate) struct AcceptWaiter {
    pub connection_id: Uuid,
    pub in_channel: InChannel,
    pub out_channel: OutChannel,
    /// we used our last pooled channel to the remote, so we ask it to broadcast
    pub do_client_broadcast: bool,
    pub issued: Instant,
}

impl AcceptWaiter {
    pub fn dispose(self) {
        self.in_channel.dispose();
        self.out_channel.dispose();
    }
}

/// A remote's Accept packet arrived on one of our in-channels
pub(crate) struct ClientAcceptEvent {
    pub connection_id: Uuid,
    pub in_channel: InChannel,
    pub do_client_broadcast: bool,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum ChannelCloseOrigin {
    /// one of our guarded streams failed or was shut down
    Local,
    /// an in-channel we were listening on failed before it was claimed, and the remote should
    ///  drop the corresponding out-channel
    LocalUnbound,
    /// the remote told us that its in-channel for one of our out-channels is gone
    Remote,
}

pub(crate) struct ChannelClosedEvent {
    pub channel_id: Uuid,
    pub dispatcher_id: Option<String>,
    pub origin: ChannelCloseOrigin,
    pub issued: Instant,
}

impl ChannelClosedEvent {
    pub fn new(channel_id: Uuid, dispatcher_id: Option<String>, origin: ChannelCloseOrigin) -> ChannelClosedEvent {
        ChannelClosedEvent {
            channel_id,
            dispatcher_id,
            origin,
            issued: Instant::now(),
        }
    }
}

pub(crate) struct ConnectionClosedEvent {
    pub connection_id: Uuid,
    /// the remote closed the connection, so there is no need to tell it
    pub from_remote: bool,
    /// the remote dispatcher to notify, once it is known
    pub to_send: Option<String>,
    pub issued: Instant,
}

impl ConnectionClosedEvent {
    pub fn new(connection_id: Uuid, from_remote: bool) -> ConnectionClosedEvent {
        ConnectionClosedEvent {
            connection_id,
            from_remote,
            to_send: None,
            issued: Instant::now(),
        }
    }
}

pub(crate) struct TimerEvent {
    /// number of regular (i.e. not triggered out of band) broadcast ticks so far
    pub count: u32,
}
