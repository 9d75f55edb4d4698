use std::fmt::{Debug, Formatter};

use tokio::time::Instant;
use uuid::Uuid;

use crate::channel::stream_guard::{BoxReader, BoxWriter, StreamGuard};
use crate::wire::wire_format::{self, Op, PacketDisplay};

/// One direction of physical transport, i.e. one long-lived HTTP stream.
///
/// The dispatcher owns all channels it knows about by value. A channel refers to its remote and
///  its connection by id only, and it reaches the dispatcher solely through the close callback
///  registered with its [StreamGuard].
pub struct Channel<S> {
    pub channel_id: Uuid,
    /// the remote dispatcher's id
    pub dispatcher_id: String,
    /// set when the channel is claimed by a connection
    pub connection_id: Option<Uuid>,
    pub since: Instant,
    stream: StreamGuard<S>,
}

/// A stream we read from: the response body of one of our own probe requests
pub type InChannel = Channel<BoxReader>;

/// A stream we write to: the still-open response to a remote dispatcher's probe request.
///  Disposing it ends that HTTP response.
pub type OutChannel = Channel<BoxWriter>;

impl <S> Debug for Channel<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Channel{{{} to {:?}", self.channel_id.simple(), self.dispatcher_id)?;
        if let Some(connection_id) = &self.connection_id {
            write!(f, " for {}", connection_id.simple())?;
        }
        write!(f, "}}")
    }
}

impl <S: Unpin> Channel<S> {
    pub fn new(channel_id: Uuid, dispatcher_id: String, stream: StreamGuard<S>) -> Channel<S> {
        Channel {
            channel_id,
            dispatcher_id,
            connection_id: None,
            since: Instant::now(),
            stream,
        }
    }

    /// a handle to the guarded stream, sharing the underlying stream with the channel
    pub fn stream(&self) -> StreamGuard<S> {
        self.stream.clone()
    }

    pub fn dispose(&self) {
        self.stream.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.stream.is_disposed()
    }
}

impl OutChannel {
    pub async fn send(&self, op: Op, connection_id: Uuid) -> anyhow::Result<()> {
        let mut stream = self.stream.clone();
        wire_format::send(&mut stream, op, connection_id).await?;
        tracing::trace!(channel_id = %self.channel_id, destination = %self.dispatcher_id, "sent {:?}", PacketDisplay(op, connection_id));
        Ok(())
    }
}
